//! Shared fuzzing and testing infrastructure for `dynamic_size_pool`.

use dynamic_size_pool::{AllocError, Allocator, DynamicSizePool, Lock, SingleThreadedLock};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{alloc::Layout, cell::Cell, collections::BTreeMap, ptr::NonNull};

/// The largest allocation size that generated test operations request.
pub const MAX_SIZE: usize = 1024;

/// A backing allocator that hands out consecutive ranges of one big buffer.
///
/// Chunks whose sizes are multiples of their alignment therefore end up
/// adjacent in memory, which exercises the pool's refusal to merge blocks
/// across chunk boundaries. Memory is never reused: deallocation only updates
/// the live-chunk count, and the buffer is freed when the allocator is
/// dropped.
pub struct BumpAllocator {
    base: NonNull<u8>,
    layout: Layout,
    cursor: Cell<usize>,
    live: Cell<usize>,
}

impl BumpAllocator {
    /// Alignment of the underlying buffer.
    const BUFFER_ALIGN: usize = 4096;

    /// Create a bump allocator over a fresh buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity.max(1), Self::BUFFER_ALIGN)
            .expect("bump allocator capacity too large");
        let base = unsafe { std::alloc::alloc(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        BumpAllocator {
            base,
            layout,
            cursor: Cell::new(0),
            live: Cell::new(0),
        }
    }

    /// The number of chunks handed out and not yet deallocated.
    pub fn live_chunks(&self) -> usize {
        self.live.get()
    }
}

impl Drop for BumpAllocator {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl Allocator for BumpAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let start = self
            .cursor
            .get()
            .checked_next_multiple_of(layout.align())
            .ok_or(AllocError)?;
        let end = start.checked_add(layout.size()).ok_or(AllocError)?;
        if end > self.layout.size() {
            log::debug!("bump allocator exhausted: {layout:?} does not fit");
            return Err(AllocError);
        }
        self.cursor.set(end);
        self.live.set(self.live.get() + 1);
        let ptr = unsafe { self.base.add(start) };
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        assert!(
            offset + layout.size() <= self.cursor.get(),
            "deallocating {ptr:p} which was never handed out"
        );
        self.live.set(self.live.get() - 1);
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: u16 },
    Dealloc { id: u32 },
    DoubleFree { id: u32 },
    FreeInterior { id: u32, offset: u16 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: ctx.rng().gen_index(MAX_SIZE + 1).unwrap() as u16,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::DoubleFree {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::FreeInterior {
                    id: ctx.rng().gen_u32(),
                    offset: ctx.rng().gen_u32() as u16,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Dealloc { id }
                    | Op::DoubleFree { id }
                    | Op::FreeInterior { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Release an existing allocation, correctly or otherwise.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let f = ctx
                        .rng()
                        .choose([
                            |id: u32, _: u16| Op::Dealloc { id },
                            |id: u32, _: u16| Op::DoubleFree { id },
                            |id: u32, offset: u16| Op::FreeInterior { id, offset },
                        ])
                        .unwrap();
                    let release_op = f(id, ctx.rng().gen_u32() as u16);
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, release_op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $($msg:tt)+ ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($($msg)+);
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit, on a pool
    /// with the given chunk size floor whose chunks come from a
    /// [`BumpAllocator`] and so sit next to each other.
    pub fn run(&self, allocation_limit: usize, min_bytes: usize) -> Result<(), String> {
        let bump = BumpAllocator::new(4 * allocation_limit + 4 * MAX_SIZE.max(min_bytes));
        let pool = DynamicSizePool::with_min_bytes(&bump, SingleThreadedLock::new(), min_bytes);
        self.run_with_pool(pool, allocation_limit)?;
        ensure!(
            bump.live_chunks() == 0,
            "{} chunks were not returned to the backing allocator",
            bump.live_chunks()
        );
        Ok(())
    }

    /// Run these test operations against the given pool and allocation limit.
    pub fn run_with_pool<A, L>(
        &self,
        mut pool: DynamicSizePool<A, L>,
        allocation_limit: usize,
    ) -> Result<(), String>
    where
        A: Allocator,
        L: Lock,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);
        let mut freed: BTreeMap<u32, NonNull<u8>> = BTreeMap::new();

        // Fill an allocation with the given byte pattern.
        let fill = |ptr: NonNull<[u8]>, byte: u8| unsafe {
            ptr.cast::<u8>().write_bytes(byte, ptr.len());
        };

        // Assert that no two live allocations overlap.
        let assert_not_overlapping = |live: &LiveMap, ptr: NonNull<[u8]>| -> Result<(), String> {
            let ptr_start = ptr.cast::<u8>().as_ptr() as usize;
            let ptr_end = ptr_start + ptr.len();
            for other in live.map.values() {
                let other_start = other.cast::<u8>().as_ptr() as usize;
                let other_end = other_start + other.len();
                ensure!(
                    ptr_end <= other_start || other_end <= ptr_start,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size } => {
                    let size = usize::from(size);
                    if live.beyond_allocation_limit(size.max(1)) {
                        continue;
                    }
                    let Ok(ptr) = pool.allocate(size) else {
                        continue;
                    };
                    if let Some(old) = live.remove(id) {
                        fill(old, FREE_POISON_PATTERN);
                        ensure!(pool.deallocate(old.cast()), "failed to release live id{id}");
                        freed.insert(id, old.cast());
                    }

                    log::debug!("new allocation: id{id} -> {ptr:p} ({} bytes)", ptr.len());
                    ensure!(ptr.len() == size.max(1), "allocation has the wrong length");
                    ensure!(
                        unsafe { ptr.as_ref() }.iter().all(|b| *b == 0),
                        "fresh allocation is not zeroed"
                    );
                    assert_not_overlapping(&live, ptr)?;
                    fill(ptr, LIVE_POISON_PATTERN);
                    live.insert(id, ptr);
                }

                Op::Dealloc { id } => {
                    if let Some(ptr) = live.remove(id) {
                        ensure!(
                            unsafe { ptr.as_ref() }
                                .iter()
                                .all(|b| *b == LIVE_POISON_PATTERN),
                            "live allocation id{id} was clobbered"
                        );
                        fill(ptr, FREE_POISON_PATTERN);
                        ensure!(pool.deallocate(ptr.cast()), "failed to release live id{id}");
                        freed.insert(id, ptr.cast());
                    }
                }

                Op::DoubleFree { id } => {
                    if let Some(&ptr) = freed.get(&id) {
                        if !live.starts_at(ptr) {
                            let before = (pool.allocated_size(), pool.num_free_blocks());
                            ensure!(!pool.deallocate(ptr), "double free of id{id} succeeded");
                            let after = (pool.allocated_size(), pool.num_free_blocks());
                            ensure!(before == after, "rejected double free changed the pool");
                        }
                    }
                }

                Op::FreeInterior { id, offset } => {
                    if let Some(ptr) = live.map.get(&id).copied() {
                        if ptr.len() > 1 {
                            let offset = 1 + usize::from(offset) % (ptr.len() - 1);
                            let interior = unsafe { ptr.cast::<u8>().add(offset) };
                            ensure!(
                                !pool.deallocate(interior),
                                "releasing an interior pointer of id{id} succeeded"
                            );
                        }
                    }
                }
            }

            pool.check_consistency()?;
            ensure!(
                pool.allocated_size() == live.total_allocated_bytes,
                "pool reports {} allocated bytes, expected {}",
                pool.allocated_size(),
                live.total_allocated_bytes
            );
            ensure!(
                pool.num_used_blocks() == live.map.len(),
                "pool reports {} used blocks, expected {}",
                pool.num_used_blocks(),
                live.map.len()
            );
        }

        // Finally, deallocate any remaining live allocations.
        for (id, ptr) in std::mem::take(&mut live.map) {
            ensure!(pool.deallocate(ptr.cast()), "failed to release live id{id}");
        }
        pool.check_consistency()?;
        ensure!(pool.allocated_size() == 0, "allocations leaked");

        pool.release_all();
        ensure!(pool.managed_size() == 0, "chunks leaked after teardown");
        Ok(())
    }
}

// We fill our allocations with a poison pattern, just to try and catch bugs
// where the pool hands out overlapping ranges or stops zeroing reused memory.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, NonNull<[u8]>>,

    /// The sum of the lengths of all live allocations.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Is some live allocation handed out at exactly `ptr`?
    fn starts_at(&self, ptr: NonNull<u8>) -> bool {
        self.map.values().any(|p| p.cast::<u8>() == ptr)
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to remove any previous allocation
    /// with the same id first.
    fn insert(&mut self, id: u32, ptr: NonNull<[u8]>) {
        self.total_allocated_bytes += ptr.len();
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, ptr);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    /// Remove a live allocation for deallocation.
    fn remove(&mut self, id: u32) -> Option<NonNull<[u8]>> {
        let ptr = self.map.remove(&id)?;
        self.total_allocated_bytes -= ptr.len();
        Some(ptr)
    }
}
