//! The dynamic-size pool.
//!
//! Requests of any size are carved out of large chunks obtained from an inner,
//! backing allocator:
//!
//! * `allocate` finds the best-fitting free block, asking the inner allocator
//!   for a new chunk of at least `min_bytes` bytes when nothing fits, splits off
//!   exactly the requested size, and moves that block to the used list.
//!
//! * `deallocate` looks the pointer up in the address index, moves its block
//!   back to the address-ordered free list, and merges it with adjacent free
//!   blocks of the same chunk.
//!
//! A single lock guards both lists, the address index, and the counters. Every
//! operation, statistics queries included, holds it for its whole duration.

use super::*;
use crate::{
    block::{Block, BlockId, BlockSlab, BlockSupplier, List},
    free_list::{Fit, FreeList},
    lock::{Lock, Mutex},
    used_list::UsedList,
};
use alloc::vec::Vec;
use core::cmp;

/// The default floor on the size of any chunk requested from the inner
/// allocator.
pub const DEFAULT_MIN_BYTES: usize = 1 << 8;

/// The alignment of every chunk requested from the inner allocator.
///
/// Blocks are split at arbitrary byte offsets, so only the first block of each
/// chunk is guaranteed this alignment.
pub const CHUNK_ALIGN: usize = 16;

/// A variable-size memory pool layered on top of an inner allocator `A`.
///
/// Because this crate is `no_std` and does not assume the presence of an
/// operating system, you must provide your own locking mechanism via the `L`
/// type parameter. See the [`Lock`] trait for details.
///
/// Block records come from the supplier `S`, which defaults to a
/// [`BlockSlab`].
pub struct DynamicSizePool<A, L, S = BlockSlab>
where
    A: Allocator,
    L: Lock,
    S: BlockSupplier,
{
    /// The backing allocator that chunks come from.
    inner: A,

    /// The smallest chunk we will ask `inner` for.
    min_bytes: usize,

    state: Mutex<State<S>, L>,
}

struct State<S> {
    records: S,
    free: FreeList,
    used: UsedList,

    /// The sum of the sizes of all chunks currently held from the inner
    /// allocator.
    total_bytes: usize,

    /// The sum of the requested sizes of all outstanding allocations.
    alloc_bytes: usize,
}

impl<S> State<S>
where
    S: BlockSupplier,
{
    /// Move an outstanding block back to the free list.
    fn release(&mut self, id: BlockId) {
        let size = self.records.get(id).size();
        self.alloc_bytes -= size;
        self.used.release(&mut self.records, id);
        let leaked = self.free.release(&mut self.records, id);
        if leaked > 0 {
            log::warn!("leaked {leaked} block record(s) while coalescing");
        }
    }

    /// Check an address index hit against a linear walk of the used list.
    #[cfg(any(test, feature = "consistency_checks"))]
    fn cross_check_lookup(&self, ptr: NonNull<u8>, id: BlockId) {
        let scanned = self
            .used
            .iter(&self.records)
            .find(|b| self.records.get(*b).ptr() == ptr);
        assert_eq!(
            scanned,
            Some(id),
            "address index disagrees with the used list for {ptr:#p}"
        );
    }
}

impl<A, L> DynamicSizePool<A, L, BlockSlab>
where
    A: Allocator,
    L: Lock,
{
    /// Create a new, empty pool on top of the given `inner` allocator, using
    /// [`DEFAULT_MIN_BYTES`] as the chunk size floor.
    #[inline]
    pub const fn new(inner: A, lock: L) -> Self {
        Self::with_min_bytes(inner, lock, DEFAULT_MIN_BYTES)
    }

    /// Create a new, empty pool that never requests chunks smaller than
    /// `min_bytes` from `inner`.
    #[inline]
    pub const fn with_min_bytes(inner: A, lock: L, min_bytes: usize) -> Self {
        Self::with_supplier(inner, lock, BlockSlab::new(), min_bytes)
    }
}

impl<A, L, S> DynamicSizePool<A, L, S>
where
    A: Allocator,
    L: Lock,
    S: BlockSupplier,
{
    /// Create a new, empty pool that takes its block records from `supplier`.
    #[inline]
    pub const fn with_supplier(inner: A, lock: L, supplier: S, min_bytes: usize) -> Self {
        let state = State {
            records: supplier,
            free: FreeList::new(),
            used: UsedList::new(),
            total_bytes: 0,
            alloc_bytes: 0,
        };
        DynamicSizePool {
            inner,
            min_bytes,
            state: Mutex::new(state, lock),
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// The smallest chunk this pool requests from its inner allocator.
    #[inline]
    pub fn min_bytes(&self) -> usize {
        self.min_bytes
    }

    /// Allocate `size` zeroed bytes.
    ///
    /// A request for zero bytes is treated as a request for one byte, so every
    /// successful allocation has an address distinct from all other
    /// outstanding allocations.
    ///
    /// The returned memory has no alignment guarantee beyond one byte.
    ///
    /// Fails if the inner allocator cannot supply a new chunk or the block
    /// supplier is exhausted. Failures are not retried.
    pub fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let size = cmp::max(size, 1);

        let ptr = {
            let mut state = self.state.lock();
            let state = &mut *state;

            let fit = match state.free.find_best_fit(&state.records, size) {
                Some(fit) => fit,
                None => self.grow(state, size)?,
            };

            let Some(id) = state.free.split(&mut state.records, fit, size) else {
                log::warn!("out of block records while splitting a free block for {size} bytes");
                return Err(AllocError);
            };

            state.used.claim(&mut state.records, id);
            state.alloc_bytes += size;
            state.records.get(id).ptr()
        };

        log::trace!("allocated {size} bytes at {ptr:#p}");

        // Safety: the block covers `size` bytes of a chunk we hold from the
        // inner allocator, and it was just moved to the used list, so nothing
        // else will touch these bytes until it is deallocated.
        unsafe { ptr.as_ptr().write_bytes(0, size) };

        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    /// Ask the inner allocator for a new chunk large enough for `size` bytes and
    /// add it to the free list.
    fn grow(&self, state: &mut State<S>, size: usize) -> Result<Fit, AllocError> {
        let chunk_size = cmp::max(size, self.min_bytes);
        let layout = Layout::from_size_align(chunk_size, CHUNK_ALIGN).map_err(|_| AllocError)?;
        let ptr = self.inner.allocate(layout)?.cast::<u8>();

        let Some(id) = state.records.allocate(Block::new(ptr, chunk_size, true)) else {
            log::warn!("out of block records for a new {chunk_size}-byte chunk");
            // Safety: the chunk was just allocated with this layout and nothing
            // references it yet.
            unsafe { self.inner.deallocate(ptr, layout) };
            return Err(AllocError);
        };

        state.total_bytes += chunk_size;
        log::debug!(
            "grew pool by a {chunk_size}-byte chunk at {ptr:#p}; now holding {} bytes",
            state.total_bytes
        );

        Ok(state.free.insert_head(&mut state.records, id))
    }

    /// Release a pointer previously returned by [`allocate`][Self::allocate].
    ///
    /// Returns `false`, without changing anything, if `ptr` is not the start
    /// of an outstanding allocation from this pool: a double free, an interior
    /// pointer, or a pointer from elsewhere.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;

        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(id) = state.used.unregister(addr) else {
            log::warn!("ignoring release of {ptr:#p}: not an outstanding allocation");
            return false;
        };

        #[cfg(any(test, feature = "consistency_checks"))]
        state.cross_check_lookup(ptr, id);

        let size = state.records.get(id).size();
        state.release(id);
        log::trace!("deallocated {size} bytes at {ptr:#p}");
        true
    }

    /// Release every outstanding allocation and return every chunk to the inner
    /// allocator.
    ///
    /// Any pointer previously returned by this pool is dangling afterwards. The
    /// pool itself stays usable and will grow again on the next allocation.
    ///
    /// Panics if, after all blocks are freed, some free block is not the head
    /// of its chunk: that means coalescing lost track of a chunk boundary.
    pub fn release_all(&mut self) {
        let state = self.state.get_mut();

        let outstanding = state.used.indexed();
        while let Some(id) = state.used.head() {
            let addr = state.records.get(id).ptr().as_ptr() as usize;
            state.used.unregister(addr);
            state.release(id);
        }

        let mut chunks = 0;
        while let Some(id) = state.free.pop_front(&mut state.records) {
            let block = state.records.get(id);
            assert!(
                block.is_head(),
                "free block is not a chunk head at teardown: {block:?}"
            );
            let (ptr, size) = (block.ptr(), block.size());

            // Safety: this chunk was allocated from `self.inner` with exactly
            // this size and alignment, which `grow` validated, and all of its
            // blocks have been merged back into this one record.
            unsafe {
                let layout = Layout::from_size_align_unchecked(size, CHUNK_ALIGN);
                self.inner.deallocate(ptr, layout);
            }

            state.total_bytes -= size;
            chunks += 1;
            if state.records.deallocate(id).is_none() {
                log::warn!("failed to reclaim the record of chunk {ptr:#p}; leaking it");
            }
        }

        debug_assert_eq!(state.alloc_bytes, 0);
        debug_assert_eq!(state.total_bytes, 0);
        log::debug!(
            "released {outstanding} outstanding allocation(s) and returned {chunks} chunk(s)"
        );
    }

    /// The sum of the requested sizes of all outstanding allocations.
    pub fn allocated_size(&self) -> usize {
        self.state.lock().alloc_bytes
    }

    /// The number of bytes currently held from the inner allocator.
    pub fn managed_size(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// The number of bytes currently held from the inner allocator plus the
    /// block supplier's record storage.
    pub fn total_size(&self) -> usize {
        let state = self.state.lock();
        state.total_bytes + state.records.total_size()
    }

    /// Count the free blocks. This walks the whole free list.
    pub fn num_free_blocks(&self) -> usize {
        let state = self.state.lock();
        state.free.iter(&state.records).count()
    }

    /// Count the used blocks. This walks the whole used list.
    pub fn num_used_blocks(&self) -> usize {
        let state = self.state.lock();
        state.used.iter(&state.records).count()
    }

    /// Copy out the blocks of the given list, in list order: ascending address
    /// for [`List::Free`], most recently allocated first for [`List::Used`].
    ///
    /// This is a diagnostic that walks the whole list.
    pub fn blocks(&self, list: List) -> Vec<Block> {
        let state = self.state.lock();
        let ids: Vec<BlockId> = match list {
            List::Free => state.free.iter(&state.records).collect(),
            List::Used => state.used.iter(&state.records).collect(),
        };
        ids.into_iter()
            .map(|id| state.records.get(id).clone())
            .collect()
    }
}

#[cfg(any(test, feature = "consistency_checks"))]
macro_rules! ensure {
    ( $cond:expr , $($msg:tt)+ ) => {{
        let cond = $cond;
        if !cond {
            let msg = alloc::format!($($msg)+);
            let str_cond = stringify!($cond);
            return Err(alloc::format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

#[cfg(any(test, feature = "consistency_checks"))]
impl<A, L, S> DynamicSizePool<A, L, S>
where
    A: Allocator,
    L: Lock,
    S: BlockSupplier,
{
    /// Walk every list and the address index and check that the pool's
    /// invariants hold:
    ///
    /// * the free list is strictly address-ordered, and two free blocks only
    ///   touch when the second starts a new chunk;
    /// * every list's back links agree with its forward links;
    /// * the address index maps exactly the used blocks;
    /// * the counters match the lists;
    /// * the blocks of each chunk tile it with no gaps and no overlaps.
    pub fn check_consistency(&self) -> Result<(), alloc::string::String> {
        let state = self.state.lock();
        let records = &state.records;
        let mut spans = Vec::new();

        let mut prev: Option<BlockId> = None;
        for id in state.free.iter(records) {
            let block = records.get(id);
            ensure!(block.list == List::Free, "{id:?} in free list: {block:?}");
            ensure!(block.prev == prev, "{id:?} has a stale back link");
            if let Some(p) = prev {
                let before = records.get(p);
                ensure!(
                    before.end() <= block.addr(),
                    "free blocks out of order or overlapping: {before:?} then {block:?}"
                );
                ensure!(
                    before.end() != block.addr() || block.is_head(),
                    "adjacent free blocks were not merged: {before:?} then {block:?}"
                );
            }
            spans.push((block.addr(), block.size(), block.is_head()));
            prev = Some(id);
        }

        let mut prev: Option<BlockId> = None;
        let mut used_bytes = 0;
        let mut used_count = 0;
        for id in state.used.iter(records) {
            let block = records.get(id);
            ensure!(block.list == List::Used, "{id:?} in used list: {block:?}");
            ensure!(block.prev == prev, "{id:?} has a stale back link");
            ensure!(
                state.used.lookup(block.addr()) == Some(id),
                "used block missing from the address index: {block:?}"
            );
            spans.push((block.addr(), block.size(), block.is_head()));
            used_bytes += block.size();
            used_count += 1;
            prev = Some(id);
        }
        ensure!(
            state.used.indexed() == used_count,
            "address index has {} entries for {used_count} used blocks",
            state.used.indexed()
        );
        ensure!(
            state.alloc_bytes == used_bytes,
            "allocated size is {} but used blocks hold {used_bytes} bytes",
            state.alloc_bytes
        );

        spans.sort_unstable();
        let mut chunk_bytes = 0;
        let mut end: Option<usize> = None;
        for (addr, size, is_head) in spans {
            if is_head {
                ensure!(
                    end.map_or(true, |end| end <= addr),
                    "chunk at {addr:#x} overlaps the previous block"
                );
            } else {
                ensure!(
                    end == Some(addr),
                    "block at {addr:#x} does not continue its chunk (previous end {end:x?})"
                );
            }
            chunk_bytes += size;
            end = Some(addr + size);
        }
        ensure!(
            state.total_bytes == chunk_bytes,
            "managed size is {} but blocks cover {chunk_bytes} bytes",
            state.total_bytes
        );

        Ok(())
    }
}

impl<A, L, S> Drop for DynamicSizePool<A, L, S>
where
    A: Allocator,
    L: Lock,
    S: BlockSupplier,
{
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SingleThreadedLock;
    use core::cell::Cell;
    use std::{vec, vec::Vec};

    cfg_if! {
        if #[cfg(feature = "allocator_api")] {
            use alloc::alloc::Global;
        } else {
            use allocator_api2::alloc::Global;
        }
    }

    /// Counts chunks that are currently allocated from the global allocator.
    #[derive(Default)]
    struct Counting {
        live: Cell<usize>,
    }

    unsafe impl Allocator for Counting {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            let ptr = Global.allocate(layout)?;
            self.live.set(self.live.get() + 1);
            Ok(ptr)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live.set(self.live.get() - 1);
            Global.deallocate(ptr, layout);
        }
    }

    type Pool<S = BlockSlab> = DynamicSizePool<Counting, SingleThreadedLock, S>;

    fn pool(min_bytes: usize) -> Pool {
        let _ = env_logger::try_init();
        DynamicSizePool::with_min_bytes(Counting::default(), SingleThreadedLock::new(), min_bytes)
    }

    fn shape<S: BlockSupplier>(pool: &Pool<S>, list: List) -> Vec<(NonNull<u8>, usize, bool)> {
        pool.blocks(list)
            .iter()
            .map(|b| (b.ptr(), b.size(), b.is_head()))
            .collect()
    }

    #[test]
    fn first_allocation_grows_by_min_bytes() {
        let pool = pool(DEFAULT_MIN_BYTES);
        let a = pool.allocate(10).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(pool.managed_size(), DEFAULT_MIN_BYTES);
        assert_eq!(pool.allocated_size(), 10);
        assert_eq!(pool.num_free_blocks(), 1);
        assert_eq!(pool.num_used_blocks(), 1);
        assert_eq!(pool.inner().live.get(), 1);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn large_request_gets_its_own_chunk() {
        let pool = pool(64);
        pool.allocate(1000).unwrap();
        assert_eq!(pool.managed_size(), 1000);
        assert_eq!(pool.num_free_blocks(), 0);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn round_trip_restores_shape() {
        let pool = pool(DEFAULT_MIN_BYTES);
        pool.allocate(30).unwrap();
        let free_before = shape(&pool, List::Free);
        let used_before = shape(&pool, List::Used);

        let p = pool.allocate(50).unwrap();
        assert!(pool.deallocate(p.cast()));

        assert_eq!(pool.allocated_size(), 30);
        assert_eq!(shape(&pool, List::Free), free_before);
        assert_eq!(shape(&pool, List::Used), used_before);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn double_free_is_reported_and_harmless() {
        let pool = pool(DEFAULT_MIN_BYTES);
        let keep = pool.allocate(8).unwrap();
        let p = pool.allocate(16).unwrap();

        assert!(pool.deallocate(p.cast()));
        let after_first = (
            pool.allocated_size(),
            pool.managed_size(),
            pool.num_free_blocks(),
            pool.num_used_blocks(),
        );

        assert!(!pool.deallocate(p.cast()));
        let after_second = (
            pool.allocated_size(),
            pool.managed_size(),
            pool.num_free_blocks(),
            pool.num_used_blocks(),
        );
        assert_eq!(after_first, after_second);
        assert!(pool.deallocate(keep.cast()));
        pool.check_consistency().unwrap();
    }

    #[test]
    fn foreign_and_interior_pointers_are_rejected() {
        let pool = pool(DEFAULT_MIN_BYTES);
        let p = pool.allocate(16).unwrap().cast::<u8>();

        let mut local = 0u8;
        assert!(!pool.deallocate(NonNull::from(&mut local)));
        assert!(!pool.deallocate(unsafe { p.add(1) }));

        assert_eq!(pool.allocated_size(), 16);
        assert!(pool.deallocate(p));
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_block() {
        // One 100-byte chunk laid out as
        // [a:10][1][b:50][1][c:20][18]
        let pool = pool(100);
        let a = pool.allocate(10).unwrap();
        let _s1 = pool.allocate(1).unwrap();
        let b = pool.allocate(50).unwrap();
        let _s2 = pool.allocate(1).unwrap();
        let c = pool.allocate(20).unwrap();
        let _s3 = pool.allocate(18).unwrap();
        assert_eq!(pool.managed_size(), 100);
        assert_eq!(pool.num_free_blocks(), 0);

        for p in [a, b, c] {
            assert!(pool.deallocate(p.cast()));
        }
        let sizes: Vec<_> = shape(&pool, List::Free).iter().map(|s| s.1).collect();
        assert_eq!(sizes, [10, 50, 20]);

        let d = pool.allocate(15).unwrap();
        assert_eq!(d.cast::<u8>(), c.cast::<u8>());
        let sizes: Vec<_> = shape(&pool, List::Free).iter().map(|s| s.1).collect();
        assert_eq!(sizes, [10, 50, 5]);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn freed_neighbors_coalesce() {
        let pool = pool(200);
        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(100).unwrap();
        assert_eq!(pool.managed_size(), 200);
        assert_eq!(pool.num_free_blocks(), 0);

        assert!(pool.deallocate(a.cast()));
        assert!(pool.deallocate(b.cast()));

        let free = shape(&pool, List::Free);
        assert_eq!(free, [(a.cast::<u8>(), 200, true)]);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn middle_release_merges_both_sides() {
        let pool = pool(300);
        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(100).unwrap();
        let c = pool.allocate(100).unwrap();

        assert!(pool.deallocate(a.cast()));
        assert!(pool.deallocate(c.cast()));
        assert_eq!(pool.num_free_blocks(), 2);

        assert!(pool.deallocate(b.cast()));
        assert_eq!(shape(&pool, List::Free), [(a.cast::<u8>(), 300, true)]);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn zero_sized_requests_take_one_byte() {
        let pool = pool(DEFAULT_MIN_BYTES);
        let a = pool.allocate(0).unwrap();
        let b = pool.allocate(0).unwrap();
        assert_eq!(a.len(), 1);
        assert_ne!(a.cast::<u8>(), b.cast::<u8>());
        assert_eq!(pool.allocated_size(), 2);

        assert!(pool.deallocate(a.cast()));
        assert_eq!(pool.allocated_size(), 1);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn reused_memory_is_zeroed() {
        let pool = pool(DEFAULT_MIN_BYTES);
        let p = pool.allocate(64).unwrap();
        unsafe { p.cast::<u8>().write_bytes(0xAA, p.len()) };
        assert!(pool.deallocate(p.cast()));

        let q = pool.allocate(64).unwrap();
        assert_eq!(q.cast::<u8>(), p.cast::<u8>());
        let bytes = unsafe { q.as_ref() };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn release_all_returns_every_chunk() {
        let mut pool = pool(128);
        let mut ptrs = vec![];
        for size in [100, 20, 300, 7, 128, 64] {
            ptrs.push(pool.allocate(size).unwrap());
        }
        assert!(pool.deallocate(ptrs[1].cast()));
        assert!(pool.inner().live.get() > 1);

        pool.release_all();
        assert_eq!(pool.inner().live.get(), 0);
        assert_eq!(pool.allocated_size(), 0);
        assert_eq!(pool.managed_size(), 0);
        assert_eq!(pool.num_free_blocks(), 0);
        assert_eq!(pool.num_used_blocks(), 0);

        // Still usable afterwards.
        let p = pool.allocate(10).unwrap();
        assert!(pool.deallocate(p.cast()));
        pool.check_consistency().unwrap();
    }

    #[test]
    fn total_size_includes_record_storage() {
        let pool = pool(DEFAULT_MIN_BYTES);
        assert_eq!(pool.total_size(), 0);
        pool.allocate(1).unwrap();
        assert!(pool.total_size() > pool.managed_size());
    }

    #[test]
    fn record_exhaustion_on_grow_returns_the_chunk() {
        let _ = env_logger::try_init();
        let pool: Pool = DynamicSizePool::with_supplier(
            Counting::default(),
            SingleThreadedLock::new(),
            BlockSlab::with_max_slabs(0),
            DEFAULT_MIN_BYTES,
        );
        assert!(pool.allocate(10).is_err());
        assert_eq!(pool.inner().live.get(), 0);
        assert_eq!(pool.managed_size(), 0);
        assert_eq!(pool.allocated_size(), 0);
    }

    #[test]
    fn record_exhaustion_on_split_leaves_free_list_intact() {
        let _ = env_logger::try_init();
        let pool: Pool = DynamicSizePool::with_supplier(
            Counting::default(),
            SingleThreadedLock::new(),
            BlockSlab::with_max_slabs(1),
            100,
        );

        // Each split uses one more record: the chunk head plus 63 splits fill
        // the only slab.
        for _ in 0..RECORDS_PER_SLAB - 1 {
            pool.allocate(1).unwrap();
        }
        let free_before = shape(&pool, List::Free);
        assert_eq!(free_before.len(), 1);
        assert_eq!(free_before[0].1, 100 - (RECORDS_PER_SLAB - 1));

        assert!(pool.allocate(1).is_err());
        assert_eq!(shape(&pool, List::Free), free_before);
        assert_eq!(pool.allocated_size(), RECORDS_PER_SLAB - 1);

        // An exact fit needs no new record.
        let rest = pool.allocate(free_before[0].1).unwrap();
        assert_eq!(rest.cast::<u8>(), free_before[0].0);
        assert_eq!(pool.num_free_blocks(), 0);
        pool.check_consistency().unwrap();
    }

    /// A `BlockSlab` that can be told to refuse the next reclaim.
    #[derive(Default)]
    struct RefusingSlab {
        slab: BlockSlab,
        refuse_next: bool,
        refused: Option<BlockId>,
    }

    impl BlockSupplier for RefusingSlab {
        fn allocate(&mut self, block: Block) -> Option<BlockId> {
            self.slab.allocate(block)
        }

        fn deallocate(&mut self, id: BlockId) -> Option<Block> {
            if core::mem::take(&mut self.refuse_next) {
                self.refused = Some(id);
                return None;
            }
            self.slab.deallocate(id)
        }

        fn get(&self, id: BlockId) -> &Block {
            self.slab.get(id)
        }

        fn get_mut(&mut self, id: BlockId) -> &mut Block {
            self.slab.get_mut(id)
        }

        fn total_size(&self) -> usize {
            self.slab.total_size()
        }
    }

    #[test]
    fn failed_record_reclaim_leaks_the_record_not_the_bytes() {
        let _ = env_logger::try_init();
        let pool: Pool<RefusingSlab> = DynamicSizePool::with_supplier(
            Counting::default(),
            SingleThreadedLock::new(),
            RefusingSlab::default(),
            200,
        );
        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(100).unwrap();
        assert!(pool.deallocate(a.cast()));

        // Releasing `b` merges it into `a`, which hands `b`'s record back.
        pool.state.lock().records.refuse_next = true;
        assert!(pool.deallocate(b.cast()));

        {
            let state = pool.state.lock();
            assert!(state.records.refused.is_some());
            assert_eq!(state.records.slab.live_records(), 2);
        }
        assert_eq!(shape(&pool, List::Free), [(a.cast::<u8>(), 200, true)]);
        assert_eq!(pool.allocated_size(), 0);
        assert_eq!(pool.managed_size(), 200);
        pool.check_consistency().unwrap();

        // The merged block is still fully usable.
        let c = pool.allocate(200).unwrap();
        assert_eq!(c.cast::<u8>(), a.cast::<u8>());
        assert!(pool.deallocate(c.cast()));
    }

    #[test]
    fn drop_returns_chunks() {
        let _ = env_logger::try_init();
        let counting = Counting::default();
        {
            let pool = DynamicSizePool::with_min_bytes(&counting, SingleThreadedLock::new(), 32);
            for size in 1..20 {
                pool.allocate(size * 3).unwrap();
            }
            assert!(counting.live.get() > 0);
        }
        assert_eq!(counting.live.get(), 0);
    }
}
