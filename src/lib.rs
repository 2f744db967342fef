#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod block;
mod free_list;
mod lock;
mod pool;
mod used_list;

pub use block::{Block, BlockId, BlockSlab, BlockSupplier, List, RECORDS_PER_SLAB};
pub use lock::{Lock, SingleThreadedLock};
pub use pool::{DynamicSizePool, CHUNK_ALIGN, DEFAULT_MIN_BYTES};

#[cfg(feature = "parking_lot")]
pub use lock::ParkingLotLock;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
