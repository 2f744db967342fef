//! The address-ordered list of free blocks.
//!
//! Allocation uses an exact best-fit search: a linear scan that picks the
//! smallest block that is large enough, breaking ties by lowest address. There
//! are no size classes, so the scan is `O(F)` in the number of free blocks.
//!
//! Freed blocks are merged with their address-adjacent neighbors, except that a
//! head block (the first block of a chunk from the backing allocator) is never
//! swallowed by its left neighbor. The backing allocator takes memory back only
//! by the chunk's original address, so a record spanning two chunks could never
//! be returned.

use crate::block::{Block, BlockId, BlockSupplier, List};

/// A free block that can satisfy an allocation, and its free-list predecessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Fit {
    pub(crate) block: BlockId,
    pub(crate) prev: Option<BlockId>,
}

#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<BlockId>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList { head: None }
    }

    /// Iterate over the free blocks in address order.
    pub(crate) fn iter<'a, S>(&self, records: &'a S) -> impl Iterator<Item = BlockId> + 'a
    where
        S: BlockSupplier,
    {
        core::iter::successors(self.head, move |id| records.get(*id).next)
    }

    /// Find the smallest free block of at least `size` bytes.
    pub(crate) fn find_best_fit<S>(&self, records: &S, size: usize) -> Option<Fit>
    where
        S: BlockSupplier,
    {
        let mut best: Option<(Fit, usize)> = None;
        let mut prev = None;
        for id in self.iter(records) {
            let block_size = records.get(id).size;
            let better = match best {
                Some((_, best_size)) => block_size < best_size,
                None => true,
            };
            if block_size >= size && better {
                best = Some((Fit { block: id, prev }, block_size));
            }
            prev = Some(id);
        }
        best.map(|(fit, _)| fit)
    }

    /// Find the last free block whose address is below `addr`, and the block
    /// after it.
    fn neighbors<S>(&self, records: &S, addr: usize) -> (Option<BlockId>, Option<BlockId>)
    where
        S: BlockSupplier,
    {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let block = records.get(id);
            if block.addr() >= addr {
                break;
            }
            prev = Some(id);
            cursor = block.next;
        }
        (prev, cursor)
    }

    /// Link the detached record `id` between `prev` and `next`.
    fn link<S>(
        &mut self,
        records: &mut S,
        id: BlockId,
        prev: Option<BlockId>,
        next: Option<BlockId>,
    ) where
        S: BlockSupplier,
    {
        {
            let block = records.get_mut(id);
            block.list = List::Free;
            block.prev = prev;
            block.next = next;
        }
        match prev {
            Some(p) => records.get_mut(p).next = Some(id),
            None => self.head = Some(id),
        }
        if let Some(n) = next {
            records.get_mut(n).prev = Some(id);
        }
    }

    /// Insert a freshly obtained head block at its address-ordered position.
    pub(crate) fn insert_head<S>(&mut self, records: &mut S, id: BlockId) -> Fit
    where
        S: BlockSupplier,
    {
        debug_assert!(records.get(id).is_head);
        let addr = records.get(id).addr();
        let (prev, next) = self.neighbors(records, addr);
        self.link(records, id, prev, next);
        Fit { block: id, prev }
    }

    /// Carve exactly `size` bytes off the front of the fitting block and detach
    /// that block from the free list.
    ///
    /// The remainder, if any, gets a fresh record that takes the block's place
    /// in the list. If the supplier cannot provide that record, `None` is
    /// returned and the free list is left untouched.
    pub(crate) fn split<S>(&mut self, records: &mut S, fit: Fit, size: usize) -> Option<BlockId>
    where
        S: BlockSupplier,
    {
        let Fit { block: id, prev } = fit;
        let block = records.get(id);
        debug_assert_eq!(block.prev, prev);
        debug_assert!(block.size >= size);
        let next = block.next;

        let replacement = if block.size == size {
            next
        } else {
            // Safety: `size < block.size`, so the remainder starts inside the
            // block's range.
            let rest_ptr = unsafe { block.ptr.add(size) };
            let rest = Block::new(rest_ptr, block.size - size, false);
            let rest = records.allocate(rest)?;
            records.get_mut(id).size = size;
            self.link(records, rest, prev, next);
            Some(rest)
        };

        match prev {
            Some(p) => records.get_mut(p).next = replacement,
            None => self.head = replacement,
        }
        if let Some(r) = replacement {
            records.get_mut(r).prev = prev;
        }

        let block = records.get_mut(id);
        block.prev = None;
        block.next = None;
        Some(id)
    }

    /// Return a detached block to the free list, merging it with its neighbors
    /// where that is allowed.
    ///
    /// Records consumed by a merge are handed back to the supplier; the number
    /// of records that could not be reclaimed is returned.
    pub(crate) fn release<S>(&mut self, records: &mut S, id: BlockId) -> usize
    where
        S: BlockSupplier,
    {
        let (addr, is_head) = {
            let block = records.get(id);
            (block.addr(), block.is_head)
        };
        let (prev, next) = self.neighbors(records, addr);
        let mut leaked = 0;

        // A non-head block's left edge is a seam inside its own chunk, so it is
        // always safe to erase.
        let current = match prev {
            Some(p) if !is_head && records.get(p).end() == addr => {
                let size = records.get(id).size;
                records.get_mut(p).size += size;
                leaked += reclaim(records, id);
                p
            }
            _ => {
                self.link(records, id, prev, next);
                id
            }
        };

        if let Some(n) = next {
            let successor = records.get(n);
            if !successor.is_head && records.get(current).end() == successor.addr() {
                let (size, after) = (successor.size, successor.next);
                let block = records.get_mut(current);
                block.size += size;
                block.next = after;
                if let Some(a) = after {
                    records.get_mut(a).prev = Some(current);
                }
                leaked += reclaim(records, n);
            }
        }

        leaked
    }

    /// Detach and return the first free block, if any.
    pub(crate) fn pop_front<S>(&mut self, records: &mut S) -> Option<BlockId>
    where
        S: BlockSupplier,
    {
        let id = self.head?;
        let next = records.get(id).next;
        self.head = next;
        if let Some(n) = next {
            records.get_mut(n).prev = None;
        }
        let block = records.get_mut(id);
        block.next = None;
        Some(id)
    }
}

fn reclaim<S>(records: &mut S, id: BlockId) -> usize
where
    S: BlockSupplier,
{
    match records.deallocate(id) {
        Some(_) => 0,
        None => {
            log::warn!("failed to reclaim {id:?} after merging it away; leaking the record");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockSlab;
    use core::ptr::NonNull;
    use std::{vec, vec::Vec};

    /// Build a free list over `buf` with one head block per entry of `sizes`,
    /// laid out back to back.
    fn chunks(buf: &mut [u8], sizes: &[usize]) -> (BlockSlab, FreeList) {
        let mut records = BlockSlab::new();
        let mut list = FreeList::new();
        let mut offset = 0;
        for &size in sizes {
            let ptr = NonNull::new(buf[offset..].as_mut_ptr()).unwrap();
            let id = records.allocate(Block::new(ptr, size, true)).unwrap();
            list.insert_head(&mut records, id);
            offset += size;
        }
        (records, list)
    }

    fn shape(records: &BlockSlab, list: &FreeList) -> Vec<(usize, bool)> {
        list.iter(records)
            .map(|id| {
                let b = records.get(id);
                (b.size, b.is_head)
            })
            .collect()
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_block() {
        let mut buf = vec![0u8; 80];
        let (records, list) = chunks(&mut buf, &[10, 50, 20]);

        let fit = list.find_best_fit(&records, 15).unwrap();
        assert_eq!(records.get(fit.block).size, 20);
        assert_eq!(records.get(fit.prev.unwrap()).size, 50);

        assert!(list.find_best_fit(&records, 51).is_none());
    }

    #[test]
    fn best_fit_breaks_ties_by_lowest_address() {
        let mut buf = vec![0u8; 90];
        let (records, list) = chunks(&mut buf, &[30, 20, 20, 20]);
        let fit = list.find_best_fit(&records, 20).unwrap();
        assert_eq!(records.get(fit.block).addr(), buf.as_ptr() as usize + 30);
    }

    #[test]
    fn heads_are_inserted_in_address_order() {
        let mut buf = vec![0u8; 30];
        let mut records = BlockSlab::new();
        let mut list = FreeList::new();
        for offset in [20, 0, 10] {
            let ptr = NonNull::new(buf[offset..].as_mut_ptr()).unwrap();
            let id = records.allocate(Block::new(ptr, 10, true)).unwrap();
            list.insert_head(&mut records, id);
        }
        let addrs: Vec<_> = list
            .iter(&records)
            .map(|id| records.get(id).addr() - buf.as_ptr() as usize)
            .collect();
        assert_eq!(addrs, [0, 10, 20]);
    }

    #[test]
    fn split_leaves_remainder_in_place() {
        let mut buf = vec![0u8; 300];
        let (mut records, mut list) = chunks(&mut buf, &[100, 200]);

        let fit = list.find_best_fit(&records, 150).unwrap();
        let taken = list.split(&mut records, fit, 150).unwrap();
        assert_eq!(records.get(taken).size, 150);
        assert_eq!(shape(&records, &list), [(100, true), (50, false)]);

        let fit = list.find_best_fit(&records, 100).unwrap();
        list.split(&mut records, fit, 100).unwrap();
        assert_eq!(shape(&records, &list), [(50, false)]);
        assert_eq!(records.get(list.head.unwrap()).prev, None);
    }

    #[test]
    fn release_merges_within_a_chunk_only() {
        let mut buf = vec![0u8; 400];
        let (mut records, mut list) = chunks(&mut buf, &[200, 200]);

        fn take(records: &mut BlockSlab, list: &mut FreeList, size: usize) -> BlockId {
            let fit = list.find_best_fit(&*records, size).unwrap();
            list.split(records, fit, size).unwrap()
        }
        let a = take(&mut records, &mut list, 200);
        let b = take(&mut records, &mut list, 100);
        let c = take(&mut records, &mut list, 100);
        assert!(list.head.is_none());

        assert_eq!(list.release(&mut records, c), 0);
        assert_eq!(list.release(&mut records, a), 0);
        assert_eq!(shape(&records, &list), [(200, true), (100, false)]);

        assert_eq!(list.release(&mut records, b), 0);
        assert_eq!(shape(&records, &list), [(200, true), (200, true)]);
        assert_eq!(records.live_records(), 2);
    }

    #[test]
    fn pop_front_detaches_in_address_order() {
        let mut buf = vec![0u8; 30];
        let (mut records, mut list) = chunks(&mut buf, &[10, 20]);
        let first = list.pop_front(&mut records).unwrap();
        assert_eq!(records.get(first).size, 10);
        assert_eq!(shape(&records, &list), [(20, true)]);
        assert_eq!(records.get(list.head.unwrap()).prev, None);
    }
}
