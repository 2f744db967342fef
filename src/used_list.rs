//! Blocks currently handed out to callers.
//!
//! The used list is kept in insertion order, which is immaterial to
//! correctness: it exists for bookkeeping and for tearing the pool down. The
//! address index maps each outstanding data address to its record so that
//! deallocation never has to scan the list.

use crate::block::{BlockId, BlockSupplier, List};
use alloc::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct UsedList {
    head: Option<BlockId>,
    index: BTreeMap<usize, BlockId>,
}

impl UsedList {
    pub(crate) const fn new() -> Self {
        UsedList {
            head: None,
            index: BTreeMap::new(),
        }
    }

    pub(crate) fn head(&self) -> Option<BlockId> {
        self.head
    }

    /// The number of outstanding allocations, according to the address index.
    pub(crate) fn indexed(&self) -> usize {
        self.index.len()
    }

    /// Iterate over the used blocks, most recently claimed first.
    pub(crate) fn iter<'a, S>(&self, records: &'a S) -> impl Iterator<Item = BlockId> + 'a
    where
        S: BlockSupplier,
    {
        core::iter::successors(self.head, move |id| records.get(*id).next)
    }

    /// Prepend a detached block to the used list and register its address.
    pub(crate) fn claim<S>(&mut self, records: &mut S, id: BlockId)
    where
        S: BlockSupplier,
    {
        let old_head = self.head;
        let addr = {
            let block = records.get_mut(id);
            debug_assert!(block.prev.is_none() && block.next.is_none());
            block.list = List::Used;
            block.prev = None;
            block.next = old_head;
            block.addr()
        };
        if let Some(h) = old_head {
            records.get_mut(h).prev = Some(id);
        }
        self.head = Some(id);

        let old = self.index.insert(addr, id);
        assert!(old.is_none(), "{addr:#x} handed out twice");
    }

    /// Find the block that was handed out at `addr`.
    pub(crate) fn lookup(&self, addr: usize) -> Option<BlockId> {
        self.index.get(&addr).copied()
    }

    /// Remove `addr`'s entry from the address index, returning its block.
    ///
    /// The block stays linked until it is passed to `release`.
    pub(crate) fn unregister(&mut self, addr: usize) -> Option<BlockId> {
        self.index.remove(&addr)
    }

    /// Unlink a block from the used list using its own `prev` link.
    pub(crate) fn release<S>(&mut self, records: &mut S, id: BlockId)
    where
        S: BlockSupplier,
    {
        let (prev, next) = {
            let block = records.get_mut(id);
            debug_assert_eq!(block.list, List::Used);
            let links = (block.prev, block.next);
            block.prev = None;
            block.next = None;
            links
        };
        match prev {
            Some(p) => records.get_mut(p).next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            records.get_mut(n).prev = prev;
        }
    }
}
