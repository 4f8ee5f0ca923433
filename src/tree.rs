//! Persistent ordered map over the free map and file set.
//!
//! A B+-tree whose nodes are buckets of one fixed block size. Leaves hold
//! user values; internal nodes hold routing entries whose values are child
//! block addresses. Block storage comes from the free map, block I/O goes
//! through the file set, and recently used blocks sit in a small
//! write-back cache.
//!
//! Routing: an internal entry `(k, child)` promises `k <=` every key under
//! `child`, except that a node's first separator may sit above its first
//! child's minimum; keys below it route to the first child regardless.
//! Lookups take the floor entry with that first-child fallback.

use log::debug;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bucket::{Bucket, BucketStrategy, ENTRY_LEN, HEADER_LEN};
use crate::cache::{BlockCache, CachedBlock};
use crate::error::StoreError;
use crate::fileset::{FileSet, SetId};
use crate::freemap::{FreeMap, Strategy};
use crate::meta::{META_LEN, TreeMeta};
use crate::types::{BlockAddr, FileId};

/// On-disk child pointer stored as an internal entry's value.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ChildRecord {
    file: U32,
    offset: U64,
}

const CHILD_LEN: usize = size_of::<ChildRecord>();

/// Smallest block size the tree accepts; must leave room for two
/// maximum-length routing entries.
pub const MIN_BLOCK_SIZE: u32 = 128;

fn decode_child(bytes: &[u8]) -> Result<BlockAddr, StoreError> {
    let (rec, _) = ChildRecord::ref_from_prefix(bytes)
        .map_err(|_| StoreError::Invalid("truncated child record"))?;
    let file = rec.file.get();
    if file > FileId::MAX as u32 {
        return Err(StoreError::Invalid("child file id out of range"));
    }
    Ok(BlockAddr::new(file as FileId, rec.offset.get()))
}

fn encode_child(addr: BlockAddr, out: &mut [u8]) -> Result<(), StoreError> {
    let rec = ChildRecord {
        file: U32::new(addr.file as u32),
        offset: U64::new(addr.offset),
    };
    rec.write_to(&mut out[..CHILD_LEN])
        .map_err(|_| StoreError::Invalid("child record slot too small"))
}

/// Longest key a block of `block_size` can carry while still fitting two
/// routing entries per internal node.
fn max_key_len(block_size: usize) -> usize {
    (block_size - HEADER_LEN - 2 * (ENTRY_LEN + CHILD_LEN)) / 2
}

/// Tree geometry and tuning. The geometry fields are persisted at
/// creation; on open the stored values win.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub block_size: u32,
    pub leaf_strategy: BucketStrategy,
    pub node_strategy: BucketStrategy,
    pub freemap_strategy: Strategy,
    pub append_slack: u64,
    pub cache_blocks: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            block_size: 8192,
            leaf_strategy: BucketStrategy::FlatSorted,
            node_strategy: BucketStrategy::FlatSorted,
            freemap_strategy: Strategy::FirstFit,
            append_slack: 0,
            cache_blocks: 16,
        }
    }
}

impl TreeOptions {
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn freemap_strategy(mut self, strategy: Strategy) -> Self {
        self.freemap_strategy = strategy;
        self
    }

    pub fn append_slack(mut self, slack: u64) -> Self {
        self.append_slack = slack;
        self
    }

    pub fn cache_blocks(mut self, blocks: usize) -> Self {
        self.cache_blocks = blocks;
        self
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(StoreError::Invalid("block size below minimum"));
        }
        if self.leaf_strategy != BucketStrategy::FlatSorted
            || self.node_strategy != BucketStrategy::FlatSorted
        {
            return Err(StoreError::Invalid("tree nodes require a sorted bucket strategy"));
        }
        Ok(())
    }
}

/// One level of a root-to-leaf descent.
struct PathStep {
    addr: BlockAddr,
    /// Child index taken in this internal node.
    slot: u32,
    /// The search key was below the node's first separator.
    below_min: bool,
}

/// Iteration state for [`Iobtree::next_term`]. One cursor walks one tree;
/// any mutating call on the tree invalidates outstanding cursors.
#[derive(Debug, Default)]
pub struct TreeCursor {
    /// `(node, child slot)` per internal level of the current descent.
    stack: Vec<(BlockAddr, u32)>,
    leaf: Option<BlockAddr>,
    slot: u32,
    started: bool,
    done: bool,
}

/// Persistent ordered map from byte-string keys to variable-length values.
#[derive(Debug)]
pub struct Iobtree {
    fileset: FileSet,
    set: SetId,
    freemap: FreeMap,
    cache: BlockCache,
    block_size: u32,
    leaf_strategy: BucketStrategy,
    node_strategy: BucketStrategy,
    root: BlockAddr,
    /// Internal levels above the leaves; 0 means the root is a leaf.
    height: u32,
    entries: u64,
    meta_dirty: bool,
}

impl Iobtree {
    /// Create a fresh tree in `set`, reserving the header block at the
    /// start of file 0 and allocating an empty root leaf.
    pub fn create(
        mut fileset: FileSet,
        set: SetId,
        options: TreeOptions,
    ) -> Result<Self, StoreError> {
        options.validate()?;
        let mut freemap = FreeMap::new(options.freemap_strategy, options.append_slack);
        let bs = options.block_size as u64;
        let header = {
            let mut src = fileset.grow_source(set);
            freemap.alloc(bs, true, &mut src)?
        };
        if header.file != 0 || header.offset != 0 {
            return Err(StoreError::Invalid("first file cannot hold the header block"));
        }
        let root = {
            let mut src = fileset.grow_source(set);
            freemap.alloc(bs, true, &mut src)?
        };
        let mut tree = Iobtree {
            fileset,
            set,
            freemap,
            cache: BlockCache::new(options.cache_blocks),
            block_size: options.block_size,
            leaf_strategy: options.leaf_strategy,
            node_strategy: options.node_strategy,
            root: BlockAddr::new(root.file, root.offset),
            height: 0,
            entries: 0,
            meta_dirty: true,
        };
        let mut buf = vec![0u8; tree.block_size as usize];
        Bucket::format(&mut buf, tree.leaf_strategy)?;
        let root = tree.root;
        tree.install(root, CachedBlock { buf, dirty: true })?;
        tree.flush()?;
        Ok(tree)
    }

    /// Open an existing tree, verifying its summary record and rebuilding
    /// the free map by walking every node.
    pub fn open(
        mut fileset: FileSet,
        set: SetId,
        options: TreeOptions,
    ) -> Result<Self, StoreError> {
        let mut capacities = Vec::new();
        while fileset.exists(set, capacities.len() as u32) {
            capacities.push(fileset.open_existing(set, capacities.len() as u32)?);
        }
        if capacities.is_empty() {
            return Err(StoreError::NotFound("store files"));
        }
        let mut head = vec![0u8; META_LEN];
        fileset.read_at(set, 0, 0, &mut head)?;
        let meta = TreeMeta::from_block(&head)?;
        if meta.block_size < MIN_BLOCK_SIZE {
            return Err(StoreError::Invalid("stored block size below minimum"));
        }

        let mut freemap = FreeMap::new(options.freemap_strategy, options.append_slack);
        for capacity in &capacities {
            freemap.add_file(*capacity)?;
        }
        freemap
            .alloc_at(0, 0, meta.block_size as u64, true)
            .map_err(|_| StoreError::Invalid("header block not free during rebuild"))?;
        reserve_nodes(&mut fileset, set, &mut freemap, meta.block_size, meta.root, meta.height)?;

        Ok(Iobtree {
            fileset,
            set,
            freemap,
            cache: BlockCache::new(options.cache_blocks),
            block_size: meta.block_size,
            leaf_strategy: meta.leaf_strategy,
            node_strategy: meta.node_strategy,
            root: meta.root,
            height: meta.height,
            entries: meta.entries,
            meta_dirty: false,
        })
    }

    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn freemap(&self) -> &FreeMap {
        &self.freemap
    }

    /// Write every dirty block and the summary record back to the file
    /// set. The boundary after which a clean shutdown loses nothing.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let set = self.set;
        for (addr, blk) in self.cache.iter_mut() {
            if blk.dirty {
                self.fileset.write_at(set, addr.file, addr.offset, &blk.buf)?;
                blk.dirty = false;
            }
        }
        if self.meta_dirty {
            let meta = TreeMeta {
                block_size: self.block_size,
                leaf_strategy: self.leaf_strategy,
                node_strategy: self.node_strategy,
                root: self.root,
                height: self.height,
                entries: self.entries,
            };
            let mut buf = vec![0u8; self.block_size as usize];
            meta.write_to_block(&mut buf)?;
            self.fileset.write_at(set, 0, 0, &buf)?;
            self.meta_dirty = false;
        }
        Ok(())
    }

    /// Flush, then hand back the file set and free map.
    pub fn into_parts(mut self) -> Result<(FileSet, FreeMap), StoreError> {
        self.flush()?;
        Ok((self.fileset, self.freemap))
    }

    /// Walk the tree releasing every block (header included) back to the
    /// free map, then hand back the parts.
    pub fn destroy(mut self) -> Result<(FileSet, FreeMap), StoreError> {
        self.flush()?;
        self.cache.clear();
        let root = self.root;
        let height = self.height;
        self.free_subtree(root, height)?;
        let bs = self.block_size as u64;
        self.freemap.free(0, 0, bs)?;
        Ok((self.fileset, self.freemap))
    }

    // ---- block movement -------------------------------------------------

    fn install(&mut self, addr: BlockAddr, block: CachedBlock) -> Result<(), StoreError> {
        if let Some((evicted, blk)) = self.cache.put(addr, block) {
            if blk.dirty {
                self.fileset
                    .write_at(self.set, evicted.file, evicted.offset, &blk.buf)?;
            }
        }
        Ok(())
    }

    fn block_mut(&mut self, addr: BlockAddr) -> Result<&mut CachedBlock, StoreError> {
        if !self.cache.contains(addr) {
            let mut buf = vec![0u8; self.block_size as usize];
            self.fileset.read_at(self.set, addr.file, addr.offset, &mut buf)?;
            self.install(addr, CachedBlock { buf, dirty: false })?;
        }
        self.cache
            .get_mut(addr)
            .ok_or(StoreError::Invalid("block missing from cache"))
    }

    /// Take a block out of the cache (reading it if necessary) so two
    /// blocks can be mutated at once. Balance with [`Iobtree::install`].
    fn take_block(&mut self, addr: BlockAddr) -> Result<CachedBlock, StoreError> {
        if let Some(block) = self.cache.take(addr) {
            return Ok(block);
        }
        let mut buf = vec![0u8; self.block_size as usize];
        self.fileset.read_at(self.set, addr.file, addr.offset, &mut buf)?;
        Ok(CachedBlock { buf, dirty: false })
    }

    fn alloc_block(&mut self) -> Result<BlockAddr, StoreError> {
        let bs = self.block_size as u64;
        let ext = {
            let mut src = self.fileset.grow_source(self.set);
            self.freemap.alloc(bs, true, &mut src)?
        };
        debug_assert_eq!(ext.offset % bs, 0, "block allocation misaligned");
        Ok(BlockAddr::new(ext.file, ext.offset))
    }

    fn bucket_entries(&mut self, addr: BlockAddr) -> Result<u32, StoreError> {
        let blk = self.block_mut(addr)?;
        Ok(Bucket::new(&mut blk.buf)?.entries())
    }

    fn child_at(&mut self, addr: BlockAddr, slot: u32) -> Result<BlockAddr, StoreError> {
        let blk = self.block_mut(addr)?;
        let b = Bucket::new(&mut blk.buf)?;
        decode_child(b.value_at(slot))
    }

    fn payload_of(&mut self, addr: BlockAddr) -> Result<usize, StoreError> {
        let blk = self.block_mut(addr)?;
        Ok(Bucket::new(&mut blk.buf)?.payload())
    }

    // ---- descent --------------------------------------------------------

    fn descend(&mut self, key: &[u8]) -> Result<(BlockAddr, Vec<PathStep>), StoreError> {
        let mut addr = self.root;
        let mut path = Vec::with_capacity(self.height as usize);
        for _ in 0..self.height {
            let (slot, below_min, child) = {
                let blk = self.block_mut(addr)?;
                let b = Bucket::new(&mut blk.buf)?;
                if b.entries() == 0 {
                    return Err(StoreError::Invalid("empty internal node"));
                }
                let (slot, below) = match b.search(key) {
                    Ok(i) => (i, false),
                    Err(0) => (0, true),
                    Err(p) => (p - 1, false),
                };
                (slot, below, decode_child(b.value_at(slot))?)
            };
            path.push(PathStep { addr, slot, below_min });
            addr = child;
        }
        Ok((addr, path))
    }

    /// Descend the last-child spine without key comparisons.
    fn descend_last(&mut self) -> Result<(BlockAddr, Vec<PathStep>), StoreError> {
        let mut addr = self.root;
        let mut path = Vec::with_capacity(self.height as usize);
        for _ in 0..self.height {
            let (slot, child) = {
                let blk = self.block_mut(addr)?;
                let b = Bucket::new(&mut blk.buf)?;
                let n = b.entries();
                if n == 0 {
                    return Err(StoreError::Invalid("empty internal node"));
                }
                (n - 1, decode_child(b.value_at(n - 1))?)
            };
            path.push(PathStep { addr, slot, below_min: false });
            addr = child;
        }
        Ok((addr, path))
    }

    // ---- lookup ---------------------------------------------------------

    /// Borrow the value stored under `key`. The slice lives until the next
    /// call on this tree.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<&[u8]>, StoreError> {
        let (leaf, _) = self.descend(key)?;
        let blk = self.block_mut(leaf)?;
        let range = {
            let b = Bucket::new(&mut blk.buf)?;
            match b.position(key) {
                Some(i) => b.value_range(i),
                None => return Ok(None),
            }
        };
        Ok(Some(&blk.buf[range.0..range.0 + range.1]))
    }

    /// Borrow the value under `key` for in-place mutation. The write lands
    /// on disk at the next flush.
    pub fn get_mut(&mut self, key: &[u8]) -> Result<Option<&mut [u8]>, StoreError> {
        let (leaf, _) = self.descend(key)?;
        let blk = self.block_mut(leaf)?;
        let range = {
            let b = Bucket::new(&mut blk.buf)?;
            match b.position(key) {
                Some(i) => b.value_range(i),
                None => return Ok(None),
            }
        };
        blk.dirty = true;
        Ok(Some(&mut blk.buf[range.0..range.0 + range.1]))
    }

    // ---- insertion ------------------------------------------------------

    fn check_entry(&self, key: &[u8], value_len: usize) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::Invalid("empty key"));
        }
        let bs = self.block_size as usize;
        if key.len() > max_key_len(bs) || HEADER_LEN + ENTRY_LEN + key.len() + value_len > bs {
            return Err(StoreError::TooBig);
        }
        Ok(())
    }

    /// Insert a new entry and return its zeroed value slice for the caller
    /// to fill. Splits whatever is in the way.
    pub fn insert(&mut self, key: &[u8], value_len: usize) -> Result<&mut [u8], StoreError> {
        self.check_entry(key, value_len)?;
        loop {
            let (leaf, path) = self.descend(key)?;
            if self.try_leaf_alloc(leaf, key, value_len)? {
                self.entries += 1;
                self.meta_dirty = true;
                self.fix_min_separators(&path, key)?;
                return self.value_slice_mut(leaf, key);
            }
            self.split_and_link(leaf, true, &path, key)?;
        }
    }

    /// Insert `key -> value` in one call.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.insert(key, value.len())?.copy_from_slice(value);
        Ok(())
    }

    /// Fast-path insert of a key strictly greater than everything in the
    /// tree: goes straight down the rightmost spine, no comparisons on the
    /// way. Produces the same tree repeated [`Iobtree::insert`] would.
    pub fn append(&mut self, key: &[u8], value_len: usize) -> Result<&mut [u8], StoreError> {
        self.check_entry(key, value_len)?;
        loop {
            let (leaf, path) = self.descend_last()?;
            {
                let blk = self.block_mut(leaf)?;
                let b = Bucket::new(&mut blk.buf)?;
                let n = b.entries();
                if n > 0 && b.key_at(n - 1) >= key {
                    return Err(StoreError::Invalid("append key not above current maximum"));
                }
            }
            if self.try_leaf_alloc(leaf, key, value_len)? {
                self.entries += 1;
                self.meta_dirty = true;
                return self.value_slice_mut(leaf, key);
            }
            self.split_and_link(leaf, true, &path, key)?;
        }
    }

    /// Try to place a new entry in `leaf`; false means the bucket is full.
    fn try_leaf_alloc(
        &mut self,
        leaf: BlockAddr,
        key: &[u8],
        value_len: usize,
    ) -> Result<bool, StoreError> {
        let blk = self.block_mut(leaf)?;
        let mut b = Bucket::new(&mut blk.buf)?;
        match b.alloc(key, value_len) {
            Ok(_) => {
                blk.dirty = true;
                Ok(true)
            }
            Err(StoreError::NoSpace(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Re-borrow the value slice of `key` inside `leaf`.
    fn value_slice_mut(&mut self, leaf: BlockAddr, key: &[u8]) -> Result<&mut [u8], StoreError> {
        let blk = self.block_mut(leaf)?;
        blk.dirty = true;
        let range = {
            let b = Bucket::new(&mut blk.buf)?;
            let i = b
                .position(key)
                .ok_or(StoreError::Invalid("entry vanished after insert"))?;
            b.value_range(i)
        };
        Ok(&mut blk.buf[range.0..range.0 + range.1])
    }

    // ---- splitting ------------------------------------------------------

    /// Split `addr` and link the new right node into the parent chain.
    /// The caller re-descends afterwards; the path must be fresh.
    fn split_and_link(
        &mut self,
        addr: BlockAddr,
        is_leaf: bool,
        path: &[PathStep],
        pending_key: &[u8],
    ) -> Result<(), StoreError> {
        let (sep, right) = self.split_block(addr, is_leaf, pending_key)?;
        self.insert_routing(path, &sep, right)
    }

    /// Move the upper part of `addr`'s entries into a freshly allocated
    /// sibling. Returns the separator (minimum key of the right node) and
    /// the new address.
    fn split_block(
        &mut self,
        addr: BlockAddr,
        is_leaf: bool,
        pending_key: &[u8],
    ) -> Result<(Vec<u8>, BlockAddr), StoreError> {
        let new_addr = self.alloc_block()?;
        let strategy = if is_leaf { self.leaf_strategy } else { self.node_strategy };
        let mut old = self.take_block(addr)?;
        let mut new_buf = vec![0u8; self.block_size as usize];
        Bucket::format(&mut new_buf, strategy)?;
        let sep;
        {
            let mut ob = Bucket::new(&mut old.buf)?;
            let mut nb = Bucket::new(&mut new_buf)?;
            let n = ob.entries();
            let split = if n >= 2 {
                split_point(&ob)
            } else if pending_key > ob.key_at(0) {
                // One oversized entry: leave it and park the pending key in
                // the empty sibling once the caller retries.
                1
            } else {
                0
            };
            sep = if split < n {
                ob.key_at(split).to_vec()
            } else {
                pending_key.to_vec()
            };
            for i in split..n {
                copy_entry(&ob, i, &mut nb)?;
            }
            for i in (split..n).rev() {
                ob.remove_at(i);
            }
        }
        old.dirty = true;
        self.install(addr, old)?;
        self.install(new_addr, CachedBlock { buf: new_buf, dirty: true })?;
        debug!("split {addr} -> {new_addr}");
        Ok((sep, new_addr))
    }

    /// Insert a routing entry `(key, child)` into the node at the end of
    /// `path`, splitting upward as needed. An empty path grows the root.
    fn insert_routing(
        &mut self,
        path: &[PathStep],
        key: &[u8],
        child: BlockAddr,
    ) -> Result<(), StoreError> {
        let Some(step) = path.last() else {
            return self.grow_root(key, child);
        };
        let mut target = step.addr;
        loop {
            if self.try_node_alloc(target, key, child)? {
                return Ok(());
            }
            let (sep, right) = self.split_block(target, false, key)?;
            self.insert_routing(&path[..path.len() - 1], &sep, right)?;
            if key >= sep.as_slice() {
                target = right;
            }
        }
    }

    fn try_node_alloc(
        &mut self,
        addr: BlockAddr,
        key: &[u8],
        child: BlockAddr,
    ) -> Result<bool, StoreError> {
        let blk = self.block_mut(addr)?;
        let mut b = Bucket::new(&mut blk.buf)?;
        match b.alloc(key, CHILD_LEN) {
            Ok(slot) => {
                encode_child(child, slot)?;
                blk.dirty = true;
                Ok(true)
            }
            Err(StoreError::NoSpace(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The root split: put the old root and the new right node under a
    /// fresh internal root.
    fn grow_root(&mut self, key: &[u8], child: BlockAddr) -> Result<(), StoreError> {
        let new_root = self.alloc_block()?;
        let old_root = self.root;
        let left_key = {
            let blk = self.block_mut(old_root)?;
            let b = Bucket::new(&mut blk.buf)?;
            if b.entries() == 0 { Vec::new() } else { b.key_at(0).to_vec() }
        };
        let mut buf = vec![0u8; self.block_size as usize];
        Bucket::format(&mut buf, self.node_strategy)?;
        {
            let mut b = Bucket::new(&mut buf)?;
            encode_child(old_root, b.alloc(&left_key, CHILD_LEN)?)?;
            encode_child(child, b.alloc(key, CHILD_LEN)?)?;
        }
        self.install(new_root, CachedBlock { buf, dirty: true })?;
        self.root = new_root;
        self.height += 1;
        self.meta_dirty = true;
        debug!("new root {new_root}, height {}", self.height);
        Ok(())
    }

    /// After an insert below the old minimum, rewrite the first separator
    /// of every node the descent fell through on its first-child fallback.
    /// A separator that cannot absorb the longer key is left in place:
    /// keys below it still route to the first child, so lookups are
    /// unaffected.
    fn fix_min_separators(&mut self, path: &[PathStep], key: &[u8]) -> Result<(), StoreError> {
        for step in path {
            if !step.below_min {
                continue;
            }
            let blk = self.block_mut(step.addr)?;
            let mut b = Bucket::new(&mut blk.buf)?;
            match b.replace_key_at(0, key) {
                Ok(()) => blk.dirty = true,
                Err(StoreError::NoSpace(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ---- resize ---------------------------------------------------------

    /// Change the length of `key`'s value in place, preserving the common
    /// prefix. Returns the resized slice.
    pub fn resize(&mut self, key: &[u8], new_len: usize) -> Result<&mut [u8], StoreError> {
        let bs = self.block_size as usize;
        if HEADER_LEN + ENTRY_LEN + key.len() + new_len > bs {
            return Err(StoreError::TooBig);
        }
        loop {
            let (leaf, path) = self.descend(key)?;
            let fitted = {
                let blk = self.block_mut(leaf)?;
                let mut b = Bucket::new(&mut blk.buf)?;
                match b.realloc(key, new_len) {
                    Ok(_) => {
                        blk.dirty = true;
                        true
                    }
                    Err(StoreError::NoSpace(_)) => false,
                    Err(e) => return Err(e),
                }
            };
            if fitted {
                return self.value_slice_mut(leaf, key);
            }
            self.split_and_link(leaf, true, &path, key)?;
        }
    }

    // ---- removal --------------------------------------------------------

    /// Delete `key`, merging or redistributing underfull nodes on the way
    /// back up and collapsing the root when it is down to one child.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let (leaf, path) = self.descend(key)?;
        {
            let blk = self.block_mut(leaf)?;
            let mut b = Bucket::new(&mut blk.buf)?;
            b.remove(key)?;
            blk.dirty = true;
        }
        self.entries -= 1;
        self.meta_dirty = true;
        self.rebalance(leaf, &path)
    }

    fn rebalance(&mut self, addr: BlockAddr, path: &[PathStep]) -> Result<(), StoreError> {
        let Some(step) = path.last() else {
            return self.collapse_root();
        };
        let payload = self.payload_of(addr)?;
        let area = Bucket::payload_area(self.block_size as usize);
        if payload * 2 >= area {
            return Ok(());
        }
        let parent = step.addr;
        let slot = step.slot;
        let (left, right) = {
            let blk = self.block_mut(parent)?;
            let b = Bucket::new(&mut blk.buf)?;
            let n = b.entries();
            let left = if slot > 0 {
                Some(decode_child(b.value_at(slot - 1))?)
            } else {
                None
            };
            let right = if slot + 1 < n {
                Some(decode_child(b.value_at(slot + 1))?)
            } else {
                None
            };
            (left, right)
        };

        if let Some(l) = left {
            if self.payload_of(l)? + payload <= area {
                return self.merge_into_left(l, addr, parent, slot, path);
            }
        }
        if let Some(r) = right {
            if self.payload_of(r)? + payload <= area {
                return self.merge_into_left(addr, r, parent, slot + 1, path);
            }
        }

        // No merge fits: shift a single entry from the fuller neighbour.
        let left_payload = match left {
            Some(l) => self.payload_of(l)?,
            None => 0,
        };
        let right_payload = match right {
            Some(r) => self.payload_of(r)?,
            None => 0,
        };
        if left_payload >= right_payload {
            if let Some(l) = left {
                self.shift_from_left(l, addr, parent, slot)?;
            }
        } else if let Some(r) = right {
            self.shift_from_right(addr, r, parent, slot + 1)?;
        }
        Ok(())
    }

    /// Move every entry of `src` into its left sibling `dst`, drop `src`'s
    /// routing entry and block, and continue rebalancing upward.
    fn merge_into_left(
        &mut self,
        dst: BlockAddr,
        src: BlockAddr,
        parent: BlockAddr,
        src_slot: u32,
        path: &[PathStep],
    ) -> Result<(), StoreError> {
        let mut d = self.take_block(dst)?;
        let s = self.take_block(src)?;
        {
            let mut db = Bucket::new(&mut d.buf)?;
            let mut s_buf = s.buf;
            let sb = Bucket::new(&mut s_buf)?;
            for i in 0..sb.entries() {
                copy_entry(&sb, i, &mut db)?;
            }
        }
        d.dirty = true;
        self.install(dst, d)?;
        self.freemap.free(src.file, src.offset, self.block_size as u64)?;
        {
            let blk = self.block_mut(parent)?;
            let mut pb = Bucket::new(&mut blk.buf)?;
            pb.remove_at(src_slot);
            blk.dirty = true;
        }
        debug!("merged {src} into {dst}");
        self.rebalance(parent, &path[..path.len() - 1])
    }

    /// Move the last entry of `donor` to the front of `addr`, updating
    /// `addr`'s separator in the parent. Skipped when the new separator
    /// does not fit there.
    fn shift_from_left(
        &mut self,
        donor: BlockAddr,
        addr: BlockAddr,
        parent: BlockAddr,
        slot: u32,
    ) -> Result<(), StoreError> {
        let (moved_key, moved_size) = {
            let blk = self.block_mut(donor)?;
            let b = Bucket::new(&mut blk.buf)?;
            let n = b.entries();
            if n < 2 {
                return Ok(());
            }
            let key = b.key_at(n - 1).to_vec();
            let size = ENTRY_LEN + key.len() + b.value_range(n - 1).1;
            (key, size)
        };
        let area = Bucket::payload_area(self.block_size as usize);
        if self.payload_of(addr)? + moved_size > area
            || !self.separator_fits(parent, slot, moved_key.len())?
        {
            return Ok(());
        }
        let mut dblk = self.take_block(donor)?;
        let mut ablk = self.take_block(addr)?;
        {
            let mut db = Bucket::new(&mut dblk.buf)?;
            let mut ab = Bucket::new(&mut ablk.buf)?;
            let n = db.entries();
            copy_entry(&db, n - 1, &mut ab)?;
            db.remove_at(n - 1);
        }
        dblk.dirty = true;
        ablk.dirty = true;
        self.install(donor, dblk)?;
        self.install(addr, ablk)?;
        self.replace_separator(parent, slot, &moved_key)
    }

    /// Move the first entry of `donor` to the back of `addr`, updating
    /// `donor`'s separator in the parent.
    fn shift_from_right(
        &mut self,
        addr: BlockAddr,
        donor: BlockAddr,
        parent: BlockAddr,
        donor_slot: u32,
    ) -> Result<(), StoreError> {
        let (new_sep, moved_size) = {
            let blk = self.block_mut(donor)?;
            let b = Bucket::new(&mut blk.buf)?;
            if b.entries() < 2 {
                return Ok(());
            }
            let size = ENTRY_LEN + b.key_at(0).len() + b.value_range(0).1;
            (b.key_at(1).to_vec(), size)
        };
        let area = Bucket::payload_area(self.block_size as usize);
        if self.payload_of(addr)? + moved_size > area
            || !self.separator_fits(parent, donor_slot, new_sep.len())?
        {
            return Ok(());
        }
        let mut dblk = self.take_block(donor)?;
        let mut ablk = self.take_block(addr)?;
        {
            let mut db = Bucket::new(&mut dblk.buf)?;
            let mut ab = Bucket::new(&mut ablk.buf)?;
            copy_entry(&db, 0, &mut ab)?;
            db.remove_at(0);
        }
        dblk.dirty = true;
        ablk.dirty = true;
        self.install(donor, dblk)?;
        self.install(addr, ablk)?;
        self.replace_separator(parent, donor_slot, &new_sep)
    }

    /// Would replacing the key of `parent`'s entry at `slot` with one of
    /// `new_len` bytes fit without splitting?
    fn separator_fits(
        &mut self,
        parent: BlockAddr,
        slot: u32,
        new_len: usize,
    ) -> Result<bool, StoreError> {
        let blk = self.block_mut(parent)?;
        let b = Bucket::new(&mut blk.buf)?;
        let old_len = b.key_at(slot).len();
        Ok(b.stats().unused + old_len >= new_len)
    }

    fn replace_separator(
        &mut self,
        parent: BlockAddr,
        slot: u32,
        key: &[u8],
    ) -> Result<(), StoreError> {
        let blk = self.block_mut(parent)?;
        let mut b = Bucket::new(&mut blk.buf)?;
        b.replace_key_at(slot, key)?;
        blk.dirty = true;
        Ok(())
    }

    /// While the root is an internal node with a single child, promote the
    /// child.
    fn collapse_root(&mut self) -> Result<(), StoreError> {
        while self.height > 0 {
            let child = {
                let blk = self.block_mut(self.root)?;
                let b = Bucket::new(&mut blk.buf)?;
                if b.entries() == 1 {
                    Some(decode_child(b.value_at(0))?)
                } else {
                    None
                }
            };
            let Some(child) = child else { break };
            let old = self.root;
            self.cache.discard(old);
            self.freemap.free(old.file, old.offset, self.block_size as u64)?;
            self.root = child;
            self.height -= 1;
            self.meta_dirty = true;
            debug!("root collapsed to {child}, height {}", self.height);
        }
        Ok(())
    }

    // ---- iteration ------------------------------------------------------

    /// A fresh cursor positioned before the first entry.
    pub fn cursor(&self) -> TreeCursor {
        TreeCursor::default()
    }

    /// Yield the next entry in key order, or `None` at the end. The
    /// returned slices live until the next call on this tree.
    pub fn next_term(
        &mut self,
        cur: &mut TreeCursor,
    ) -> Result<Option<(&[u8], &[u8])>, StoreError> {
        if cur.done {
            return Ok(None);
        }
        if !cur.started {
            cur.started = true;
            let mut addr = self.root;
            for _ in 0..self.height {
                cur.stack.push((addr, 0));
                addr = self.child_at(addr, 0)?;
            }
            cur.leaf = Some(addr);
            cur.slot = 0;
        }
        let leaf = loop {
            let Some(leaf) = cur.leaf else {
                cur.done = true;
                return Ok(None);
            };
            if cur.slot < self.bucket_entries(leaf)? {
                break leaf;
            }
            if !self.advance_cursor(cur)? {
                return Ok(None);
            }
        };
        let i = cur.slot;
        cur.slot += 1;
        let blk = self.block_mut(leaf)?;
        let ((ko, kl), (vo, vl)) = {
            let b = Bucket::new(&mut blk.buf)?;
            b.entry_ranges(i)
        };
        let buf = &blk.buf;
        Ok(Some((&buf[ko..ko + kl], &buf[vo..vo + vl])))
    }

    /// Step the cursor to the first entry of the next leaf. False when the
    /// walk is over.
    fn advance_cursor(&mut self, cur: &mut TreeCursor) -> Result<bool, StoreError> {
        loop {
            let Some((addr, slot)) = cur.stack.pop() else {
                cur.done = true;
                cur.leaf = None;
                return Ok(false);
            };
            if slot + 1 >= self.bucket_entries(addr)? {
                continue;
            }
            cur.stack.push((addr, slot + 1));
            let mut down = self.child_at(addr, slot + 1)?;
            while (cur.stack.len() as u32) < self.height {
                cur.stack.push((down, 0));
                down = self.child_at(down, 0)?;
            }
            cur.leaf = Some(down);
            cur.slot = 0;
            return Ok(true);
        }
    }

    // ---- teardown helpers -----------------------------------------------

    fn free_subtree(&mut self, addr: BlockAddr, levels: u32) -> Result<(), StoreError> {
        if levels > 0 {
            let mut buf = vec![0u8; self.block_size as usize];
            self.fileset.read_at(self.set, addr.file, addr.offset, &mut buf)?;
            let children = {
                let b = Bucket::new(&mut buf)?;
                let mut v = Vec::with_capacity(b.entries() as usize);
                for i in 0..b.entries() {
                    v.push(decode_child(b.value_at(i))?);
                }
                v
            };
            for child in children {
                self.free_subtree(child, levels - 1)?;
            }
        }
        self.cache.discard(addr);
        self.freemap.free(addr.file, addr.offset, self.block_size as u64)
    }
}

/// Copy entry `i` of `src` into `dst`.
fn copy_entry(src: &Bucket<'_>, i: u32, dst: &mut Bucket<'_>) -> Result<(), StoreError> {
    let (_, vl) = src.value_range(i);
    let slot = dst.alloc(src.key_at(i), vl)?;
    slot.copy_from_slice(src.value_at(i));
    Ok(())
}

/// Index of the first entry of the right half: the point where the
/// cumulative payload crosses half, clamped so both sides keep at least
/// one entry.
fn split_point(b: &Bucket<'_>) -> u32 {
    let n = b.entries();
    let total = b.payload();
    let mut acc = 0usize;
    for i in 0..n {
        acc += ENTRY_LEN + b.key_at(i).len() + b.value_range(i).1;
        if acc * 2 >= total {
            return (i + 1).clamp(1, n - 1);
        }
    }
    n - 1
}

/// Re-reserve every block of the subtree at `addr` in the rebuilt free
/// map.
fn reserve_nodes(
    fileset: &mut FileSet,
    set: SetId,
    freemap: &mut FreeMap,
    block_size: u32,
    addr: BlockAddr,
    levels: u32,
) -> Result<(), StoreError> {
    freemap
        .alloc_at(addr.file, addr.offset, block_size as u64, true)
        .map_err(|_| StoreError::Invalid("tree block not free during rebuild"))?;
    if levels == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; block_size as usize];
    fileset.read_at(set, addr.file, addr.offset, &mut buf)?;
    let children = {
        let b = Bucket::new(&mut buf)?;
        let mut v = Vec::with_capacity(b.entries() as usize);
        for i in 0..b.entries() {
            v.push(decode_child(b.value_at(i))?);
        }
        v
    };
    for child in children {
        reserve_nodes(fileset, set, freemap, block_size, child, levels - 1)?;
    }
    Ok(())
}
