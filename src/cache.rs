//! Bounded write-back cache of tree blocks.
//!
//! Keyed by [`BlockAddr`], LRU order, small enough that a linear scan is
//! the right lookup. Dirty blocks displaced by an insert are handed back
//! to the caller for write-back; the cache itself never does I/O.

use crate::types::BlockAddr;

#[derive(Debug)]
pub struct CachedBlock {
    pub buf: Vec<u8>,
    pub dirty: bool,
}

#[derive(Debug)]
pub struct BlockCache {
    /// LRU at the front, MRU at the back.
    blocks: Vec<(BlockAddr, CachedBlock)>,
    cap: usize,
}

impl BlockCache {
    pub fn new(cap: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(cap.max(1)),
            cap: cap.max(1),
        }
    }

    pub fn contains(&self, addr: BlockAddr) -> bool {
        self.blocks.iter().any(|(a, _)| *a == addr)
    }

    /// Borrow a cached block, refreshing its LRU position.
    pub fn get_mut(&mut self, addr: BlockAddr) -> Option<&mut CachedBlock> {
        let i = self.blocks.iter().position(|(a, _)| *a == addr)?;
        let entry = self.blocks.remove(i);
        self.blocks.push(entry);
        self.blocks.last_mut().map(|(_, b)| b)
    }

    /// Remove and return a cached block, leaving its slot free.
    pub fn take(&mut self, addr: BlockAddr) -> Option<CachedBlock> {
        let i = self.blocks.iter().position(|(a, _)| *a == addr)?;
        Some(self.blocks.remove(i).1)
    }

    /// Insert a block, returning a displaced entry the caller must write
    /// back if dirty.
    pub fn put(&mut self, addr: BlockAddr, block: CachedBlock) -> Option<(BlockAddr, CachedBlock)> {
        debug_assert!(!self.contains(addr));
        self.blocks.push((addr, block));
        if self.blocks.len() > self.cap {
            Some(self.blocks.remove(0))
        } else {
            None
        }
    }

    /// Drop a block without write-back (its storage was freed).
    pub fn discard(&mut self, addr: BlockAddr) {
        self.blocks.retain(|(a, _)| *a != addr);
    }

    /// Iterate every cached block for flushing; dirty flags are the
    /// caller's to clear.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BlockAddr, &mut CachedBlock)> {
        self.blocks.iter_mut().map(|(a, b)| (*a, b))
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
