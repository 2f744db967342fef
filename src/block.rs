//! Block records and the supplier that hands them out.
//!
//! A [`Block`] never holds payload bytes: it only describes a contiguous byte
//! range inside some chunk obtained from the backing allocator, plus the block's
//! position in either the free list or the used list. Records are addressed by
//! [`BlockId`] rather than by reference so that list links stay plain indices.

use super::*;
use alloc::{boxed::Box, vec::Vec};
use core::fmt;

/// Which of the pool's two lists a block currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum List {
    /// The address-ordered list of unused blocks.
    Free,
    /// The insertion-ordered list of blocks handed out to callers.
    Used,
}

/// A stable handle to a [`Block`] record owned by a [`BlockSupplier`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl BlockId {
    /// Create a handle from a supplier-defined index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        BlockId(index)
    }

    /// The supplier-defined index behind this handle.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// Metadata describing one contiguous byte range managed by the pool.
#[derive(Clone)]
pub struct Block {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) size: usize,
    pub(crate) is_head: bool,
    pub(crate) list: List,
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
}

// Safety: a `Block` only records an address and a length. It never reads or
// writes through `ptr`; the pool that owns the chunk does, under its lock.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// A detached free block describing `size` bytes starting at `ptr`.
    #[inline]
    pub(crate) fn new(ptr: NonNull<u8>, size: usize, is_head: bool) -> Self {
        Block {
            ptr,
            size,
            is_head,
            list: List::Free,
            prev: None,
            next: None,
        }
    }

    /// The first byte of this block's range.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The length of this block's range, in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this block starts at the beginning of a chunk obtained directly
    /// from the backing allocator.
    #[inline]
    pub fn is_head(&self) -> bool {
        self.is_head
    }

    /// The list this block is currently linked into.
    #[inline]
    pub fn list(&self) -> List {
        self.list
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last byte of this block's range.
    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.addr() + self.size
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &format_args!("{:#p}", self.ptr))
            .field("size", &self.size)
            .field("is_head", &self.is_head)
            .field("list", &self.list)
            .field("prev", &self.prev)
            .field("next", &self.next)
            .finish()
    }
}

/// Supplies and reclaims the fixed-size records that describe blocks.
///
/// The pool only ever calls into its supplier while holding its lock, so
/// implementations need no synchronization of their own.
pub trait BlockSupplier {
    /// Store `block` in a fresh record, returning its handle, or `None` if the
    /// supplier is exhausted.
    fn allocate(&mut self, block: Block) -> Option<BlockId>;

    /// Reclaim the record behind `id`, returning its last contents.
    ///
    /// Returns `None` if `id` does not name a live record. The pool treats
    /// that as a leaked record, not as corruption of the byte ranges.
    fn deallocate(&mut self, id: BlockId) -> Option<Block>;

    /// Get the live record behind `id`.
    ///
    /// Panics if `id` does not name a live record.
    fn get(&self, id: BlockId) -> &Block;

    /// Get the live record behind `id` mutably.
    ///
    /// Panics if `id` does not name a live record.
    fn get_mut(&mut self, id: BlockId) -> &mut Block;

    /// The number of bytes this supplier holds for record storage.
    fn total_size(&self) -> usize;
}

/// The number of records in each of a [`BlockSlab`]'s slabs.
pub const RECORDS_PER_SLAB: usize = 1 << 6;

struct Slab {
    /// Bit `i` is set iff `records[i]` is live.
    occupied: u64,
    records: Box<[Option<Block>; RECORDS_PER_SLAB]>,
}

impl Slab {
    fn new() -> Self {
        Slab {
            occupied: 0,
            records: Box::new([const { None }; RECORDS_PER_SLAB]),
        }
    }

    fn is_full(&self) -> bool {
        self.occupied == u64::MAX
    }
}

/// The default [`BlockSupplier`]: records are carved out of fixed-size slabs of
/// [`RECORDS_PER_SLAB`] entries, with each slab's free slots tracked in a
/// bitmap.
///
/// Slabs are never returned until the supplier itself is dropped.
pub struct BlockSlab {
    slabs: Vec<Slab>,

    /// Indices of the slabs that have at least one free slot. Each non-full
    /// slab appears exactly once; new records come from the last entry.
    with_room: Vec<usize>,

    max_slabs: usize,
    live: usize,
}

impl Default for BlockSlab {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlockSlab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSlab")
            .field("slabs", &self.slabs.len())
            .field("with_room", &self.with_room.len())
            .field("max_slabs", &self.max_slabs)
            .field("live", &self.live)
            .finish()
    }
}

impl BlockSlab {
    /// Create an empty, unbounded `BlockSlab`.
    #[inline]
    pub const fn new() -> Self {
        Self::with_max_slabs(usize::MAX)
    }

    /// Create an empty `BlockSlab` that will never grow past `max_slabs`
    /// slabs, after which `allocate` reports exhaustion.
    #[inline]
    pub const fn with_max_slabs(max_slabs: usize) -> Self {
        BlockSlab {
            slabs: Vec::new(),
            with_room: Vec::new(),
            max_slabs,
            live: 0,
        }
    }

    /// The number of live records.
    #[inline]
    pub fn live_records(&self) -> usize {
        self.live
    }

    fn locate(id: BlockId) -> (usize, usize) {
        let index = id.0 as usize;
        (index / RECORDS_PER_SLAB, index % RECORDS_PER_SLAB)
    }

    fn slot(&self, id: BlockId) -> Option<&Block> {
        let (slab, slot) = Self::locate(id);
        self.slabs.get(slab)?.records[slot].as_ref()
    }

    fn slot_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        let (slab, slot) = Self::locate(id);
        self.slabs.get_mut(slab)?.records[slot].as_mut()
    }

    /// Find a slab with a free slot, growing by one slab if all are full.
    fn slab_with_room(&mut self) -> Option<usize> {
        if let Some(&i) = self.with_room.last() {
            debug_assert!(!self.slabs[i].is_full());
            return Some(i);
        }
        if self.slabs.len() >= self.max_slabs {
            return None;
        }
        let index = self.slabs.len();
        if u32::try_from((index + 1) * RECORDS_PER_SLAB).is_err() {
            return None;
        }
        self.slabs.try_reserve(1).ok()?;
        // Room for every slab up front, so `deallocate` never has to grow
        // `with_room`.
        self.with_room
            .try_reserve(index + 1 - self.with_room.len())
            .ok()?;
        self.slabs.push(Slab::new());
        self.with_room.push(index);
        log::trace!("block slab grew to {} slabs", self.slabs.len());
        Some(index)
    }
}

impl BlockSupplier for BlockSlab {
    fn allocate(&mut self, block: Block) -> Option<BlockId> {
        let slab_index = self.slab_with_room()?;
        let slab = &mut self.slabs[slab_index];
        let slot = (!slab.occupied).trailing_zeros() as usize;
        debug_assert!(slab.records[slot].is_none());

        slab.occupied |= 1 << slot;
        slab.records[slot] = Some(block);
        if slab.is_full() {
            self.with_room.pop();
        }
        self.live += 1;

        let index = slab_index * RECORDS_PER_SLAB + slot;
        Some(BlockId(index as u32))
    }

    fn deallocate(&mut self, id: BlockId) -> Option<Block> {
        let (slab_index, slot) = Self::locate(id);
        let slab = self.slabs.get_mut(slab_index)?;
        let block = slab.records[slot].take()?;
        if slab.is_full() {
            debug_assert!(self.with_room.len() < self.with_room.capacity());
            self.with_room.push(slab_index);
        }
        slab.occupied &= !(1 << slot);
        self.live -= 1;
        Some(block)
    }

    #[inline]
    fn get(&self, id: BlockId) -> &Block {
        match self.slot(id) {
            Some(block) => block,
            None => panic!("{id:?} is not a live block record"),
        }
    }

    #[inline]
    fn get_mut(&mut self, id: BlockId) -> &mut Block {
        match self.slot_mut(id) {
            Some(block) => block,
            None => panic!("{id:?} is not a live block record"),
        }
    }

    fn total_size(&self) -> usize {
        self.slabs.len() * core::mem::size_of::<[Option<Block>; RECORDS_PER_SLAB]>()
    }
}
