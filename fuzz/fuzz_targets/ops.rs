#![no_main]

use dynamic_size_pool_fuzzing::Ops;
use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;

const ALLOCATION_LIMIT: usize = 1 << 20; // 1MiB

/// Fuzz inputs are a chunk size floor, as a power of two, followed by the ops.
type Input = (u8, Ops);

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Chunk floors from 1 byte to 64KiB.
fn min_bytes(log2: u8) -> usize {
    1 << (log2 % 17)
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave roughly one in eight mutations to libFuzzer's byte-level mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let decoded = bincode::decode_from_slice::<Input, _>(&data[..size], bincode_config());
    let (mut log2, mut ops) = decoded.map_or_else(|_| (8, Ops::default()), |(input, _)| input);

    if seed % 5 == 0 {
        log2 = log2.wrapping_add(1 + (seed >> 8) as u8 % 4);
    }

    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }

    // Drop ops from the end until the input fits again.
    loop {
        if let Ok(new_size) = bincode::encode_into_slice((log2, &ops), data, bincode_config()) {
            return new_size;
        }
        if !ops.pop() {
            return fuzzer_mutate(data, size, max_size);
        }
    }
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Ok(((log2, ops), _)) = bincode::decode_from_slice::<Input, _>(data, bincode_config()) else {
        return;
    };
    if let Err(e) = ops.run(ALLOCATION_LIMIT, min_bytes(log2)) {
        panic!("error: {e}");
    }
});
