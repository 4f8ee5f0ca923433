//! Extent allocator over a file set.
//!
//! Tracks every free byte range across the set's files and serves
//! allocations under a choice of placement strategies. Two ordered indexes
//! view the same extent set: by `(file, offset)` for address lookups and
//! coalescing, and by `(length, address)` for the size-directed strategies.
//! Both are only ever touched through [`FreeMap::link`] / [`FreeMap::unlink`]
//! so they cannot drift apart.

use std::fmt;

use log::{debug, trace};

use crate::error::StoreError;
use crate::rbtree::RbTree;
use crate::types::{BlockAddr, Extent, FileId};

/// Placement strategy for [`FreeMap::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Lowest-addressed extent that fits.
    #[default]
    FirstFit,
    /// Smallest sufficient extent, earliest address on ties.
    BestFit,
    /// Largest extent.
    WorstFit,
}

/// Supplies capacities for new files when the free pool runs dry.
pub trait FileSource {
    /// Provide the capacity of new file `index`, or decline.
    fn provide(&mut self, index: u32) -> Option<u64>;
}

/// A [`FileSource`] that never grows the file set.
pub struct NoGrow;

impl FileSource for NoGrow {
    fn provide(&mut self, _index: u32) -> Option<u64> {
        None
    }
}

/// Counters reported by [`FreeMap::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeMapStats {
    /// Sum of all file capacities.
    pub capacity: u64,
    /// Bytes currently in the free pool.
    pub free: u64,
    /// Number of free extents.
    pub extents: usize,
    /// Cumulative bytes handed out beyond what callers asked for.
    pub wasted: u64,
}

#[derive(Debug)]
pub struct FreeMap {
    by_addr: RbTree<BlockAddr, u64>,
    by_len: RbTree<(u64, BlockAddr), ()>,
    strategy: Strategy,
    slack: u64,
    files: Vec<u64>,
    free_bytes: u64,
    wasted: u64,
}

impl FreeMap {
    /// `slack` is the append slack: the largest remainder the allocator
    /// will fold into a non-exact grant rather than leave behind.
    pub fn new(strategy: Strategy, slack: u64) -> Self {
        Self {
            by_addr: RbTree::new(),
            by_len: RbTree::new(),
            strategy,
            slack,
            files: Vec::new(),
            free_bytes: 0,
            wasted: 0,
        }
    }

    /// Add a file of the given capacity to the pool as one free extent.
    /// Returns its id.
    pub fn add_file(&mut self, capacity: u64) -> Result<FileId, StoreError> {
        if capacity == 0 {
            return Err(StoreError::Invalid("file capacity must be nonzero"));
        }
        if self.files.len() > FileId::MAX as usize {
            return Err(StoreError::NoSpace("file id space"));
        }
        let file = self.files.len() as FileId;
        self.files.push(capacity);
        self.link(Extent::new(file, 0, capacity))?;
        Ok(file)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file_capacity(&self, file: FileId) -> Option<u64> {
        self.files.get(file as usize).copied()
    }

    pub fn stats(&self) -> FreeMapStats {
        FreeMapStats {
            capacity: self.files.iter().sum(),
            free: self.free_bytes,
            extents: self.by_addr.len(),
            wasted: self.wasted,
        }
    }

    /// Fraction of the total capacity that is allocated.
    pub fn utilisation(&self) -> f64 {
        let capacity: u64 = self.files.iter().sum();
        if capacity == 0 {
            return 0.0;
        }
        1.0 - self.free_bytes as f64 / capacity as f64
    }

    /// The free extents in `(file, offset)` order.
    pub fn extents(&self) -> Vec<Extent> {
        self.by_addr
            .iter_in_order()
            .map(|(addr, len)| Extent::new(addr.file, addr.offset, *len))
            .collect()
    }

    fn link(&mut self, e: Extent) -> Result<(), StoreError> {
        debug_assert!(e.len > 0);
        self.by_addr.insert(e.addr(), e.len)?;
        self.by_len.insert((e.len, e.addr()), ())?;
        self.free_bytes += e.len;
        Ok(())
    }

    fn unlink(&mut self, e: Extent) {
        let removed = self.by_addr.remove(&e.addr());
        debug_assert_eq!(removed, Some(e.len));
        self.by_len.remove(&(e.len, e.addr()));
        self.free_bytes -= e.len;
    }

    /// Choose an extent of at least `wanted` bytes under the configured
    /// strategy.
    fn pick(&self, wanted: u64) -> Option<Extent> {
        match self.strategy {
            Strategy::FirstFit => self
                .by_addr
                .iter_in_order()
                .find(|(_, len)| **len >= wanted)
                .map(|(addr, len)| Extent::new(addr.file, addr.offset, *len)),
            Strategy::BestFit => self
                .by_len
                .find_ceil(&(wanted, BlockAddr::new(0, 0)))
                .map(|((len, addr), _)| Extent::new(addr.file, addr.offset, *len)),
            Strategy::WorstFit => match self.by_len.last() {
                Some(((len, addr), _)) if *len >= wanted => {
                    Some(Extent::new(addr.file, addr.offset, *len))
                }
                _ => None,
            },
        }
    }

    /// Carve a grant of `wanted` bytes out of `ext`, starting at `start`
    /// (which must lie within the extent). Applies the slack rule to the
    /// tail remainder and re-links whatever is left over.
    fn carve(&mut self, ext: Extent, start: u64, wanted: u64, exact: bool) -> Result<Extent, StoreError> {
        debug_assert!(start >= ext.offset && start + wanted <= ext.end());
        self.unlink(ext);
        let head = start - ext.offset;
        if head > 0 {
            self.link(Extent::new(ext.file, ext.offset, head))?;
        }
        let tail = ext.end() - (start + wanted);
        let granted = if !exact && tail <= self.slack {
            self.wasted += tail;
            wanted + tail
        } else {
            if tail > 0 {
                self.link(Extent::new(ext.file, start + wanted, tail))?;
            }
            wanted
        };
        Ok(Extent::new(ext.file, start, granted))
    }

    /// Allocate at least `wanted` contiguous bytes anywhere in the set.
    ///
    /// Without `exact`, up to `slack` extra bytes may be granted (and
    /// recorded as waste) to avoid leaving a sliver behind. When no extent
    /// is large enough, `source` is asked for new files until it declines.
    pub fn alloc(
        &mut self,
        wanted: u64,
        exact: bool,
        source: &mut dyn FileSource,
    ) -> Result<Extent, StoreError> {
        if wanted == 0 {
            return Err(StoreError::Invalid("zero-length allocation"));
        }
        loop {
            if let Some(ext) = self.pick(wanted) {
                let granted = self.carve(ext, ext.offset, wanted, exact)?;
                trace!("alloc {wanted} -> {granted}");
                return Ok(granted);
            }
            let index = self.files.len() as u32;
            match source.provide(index) {
                Some(capacity) => {
                    debug!("growing file set: file {index}, capacity {capacity}");
                    self.add_file(capacity)?;
                }
                None => return Err(StoreError::NoSpace("file set")),
            }
        }
    }

    /// Allocate `wanted` bytes at exactly `(file, offset)`. Succeeds only
    /// when a free extent covers that range.
    pub fn alloc_at(
        &mut self,
        file: FileId,
        offset: u64,
        wanted: u64,
        exact: bool,
    ) -> Result<Extent, StoreError> {
        if wanted == 0 {
            return Err(StoreError::Invalid("zero-length allocation"));
        }
        let probe = BlockAddr::new(file, offset);
        let Some((addr, len)) = self.by_addr.find_near(&probe) else {
            return Err(StoreError::NoSpace("requested location"));
        };
        let ext = Extent::new(addr.file, addr.offset, *len);
        if ext.file != file || ext.end() < offset + wanted {
            return Err(StoreError::NoSpace("requested location"));
        }
        let granted = self.carve(ext, offset, wanted, exact)?;
        trace!("alloc_at {file}:{offset} {wanted} -> {granted}");
        Ok(granted)
    }

    /// Extend an allocation ending at `offset + cur_len` by at least
    /// `extra` bytes using the free extent immediately after it. The
    /// allocation never moves and never crosses into another file.
    /// Returns the number of bytes actually granted.
    pub fn extend(
        &mut self,
        file: FileId,
        offset: u64,
        cur_len: u64,
        extra: u64,
        exact: bool,
    ) -> Result<u64, StoreError> {
        if extra == 0 {
            return Err(StoreError::Invalid("zero-length extension"));
        }
        let next = BlockAddr::new(file, offset + cur_len);
        let Some(len) = self.by_addr.get(&next).copied() else {
            return Err(StoreError::NoSpace("adjacent extent"));
        };
        if len < extra {
            return Err(StoreError::NoSpace("adjacent extent"));
        }
        let ext = Extent::new(file, next.offset, len);
        let granted = self.carve(ext, next.offset, extra, exact)?;
        trace!("extend {file}:{offset}+{cur_len} by {extra} -> {}", granted.len);
        Ok(granted.len)
    }

    /// Return `[offset, offset + len)` to the free pool, coalescing with
    /// any adjacent free extent on either side.
    pub fn free(&mut self, file: FileId, offset: u64, len: u64) -> Result<(), StoreError> {
        if len == 0 {
            return Err(StoreError::Invalid("zero-length free"));
        }
        let Some(&capacity) = self.files.get(file as usize) else {
            return Err(StoreError::NotFound("file"));
        };
        if offset + len > capacity {
            return Err(StoreError::Invalid("free past file capacity"));
        }

        let mut start = offset;
        let mut end = offset + len;

        // Predecessor: greatest extent starting at or before `offset`.
        let pred = self
            .by_addr
            .find_near(&BlockAddr::new(file, offset))
            .map(|(addr, plen)| Extent::new(addr.file, addr.offset, *plen))
            .filter(|e| e.file == file);
        if let Some(p) = pred {
            if p.end() > offset {
                return Err(StoreError::Invalid("free overlaps a free extent"));
            }
            if p.end() == offset {
                start = p.offset;
            }
        }

        // Successor: least extent starting after `offset`.
        let succ = self
            .by_addr
            .find_ceil(&BlockAddr::new(file, offset + 1))
            .map(|(addr, slen)| Extent::new(addr.file, addr.offset, *slen))
            .filter(|e| e.file == file);
        if let Some(s) = succ {
            if s.offset < end {
                return Err(StoreError::Invalid("free overlaps a free extent"));
            }
            if s.offset == end {
                end = s.end();
            }
        }

        // Checks passed: unlink absorbed neighbours and link the union.
        if let Some(p) = pred {
            if p.end() == offset {
                self.unlink(p);
            }
        }
        if let Some(s) = succ {
            if s.offset == offset + len {
                self.unlink(s);
            }
        }
        self.link(Extent::new(file, start, end - start))?;
        trace!("free {file}:{offset}+{len} -> [{start}, {end})");
        Ok(())
    }
}

impl fmt::Display for FreeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        writeln!(
            f,
            "freemap: {} free of {} bytes in {} extents ({} wasted, {:.1}% utilised)",
            stats.free,
            stats.capacity,
            stats.extents,
            stats.wasted,
            self.utilisation() * 100.0
        )?;
        for (addr, len) in self.by_addr.iter_in_order() {
            writeln!(f, "  {}", Extent::new(addr.file, addr.offset, *len))?;
        }
        Ok(())
    }
}
