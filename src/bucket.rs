//! Fixed-size self-describing blocks of key/value entries.
//!
//! A bucket packs a variable set of `(key, value)` entries into one block
//! with no allocation outside it. The entry table sits after the header;
//! the value heap grows upward from the table and the string (key) heap
//! grows downward from the block end, leaving a single free gap between
//! them:
//!
//! ```text
//! +--------+--------------+-------------+------  ------+-------------+
//! | header | entry table  | value heap ->      free    <- string heap|
//! +--------+--------------+-------------+------  ------+-------------+
//! ```
//!
//! Both heaps are kept dense: removal and resizing compact in place, so
//! the free region is always the one gap and a bucket can be relocated by
//! a plain byte copy. All integers are network byte order.

use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::StoreError;

/// On-disk bucket header.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct BucketHeader {
    entries: U32,
    /// First free byte above the value heap.
    value_heap_bottom: U32,
    /// Lowest byte of the string heap.
    string_heap_top: U32,
    strategy: u8,
    pad: [u8; 3],
}

/// On-disk entry table record.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct EntryRecord {
    string_off: U32,
    string_len: U32,
    value_off: U32,
    value_len: U32,
}

pub const HEADER_LEN: usize = size_of::<BucketHeader>();
pub const ENTRY_LEN: usize = size_of::<EntryRecord>();

/// In-block entry placement strategy. The byte value is persisted in the
/// bucket header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketStrategy {
    /// Entry table kept sorted by key; lookups binary search.
    #[default]
    FlatSorted = 0,
    /// Entries in insertion order; lookups scan, inserts never shift the
    /// table. Enumeration is table order.
    FlatUnsorted = 1,
}

impl BucketStrategy {
    pub fn from_byte(b: u8) -> Result<Self, StoreError> {
        match b {
            0 => Ok(Self::FlatSorted),
            1 => Ok(Self::FlatUnsorted),
            _ => Err(StoreError::Invalid("unknown bucket strategy")),
        }
    }
}

/// Space accounting for one bucket. The four byte counters always sum to
/// the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    pub entries: u32,
    /// Value bytes.
    pub utilised: usize,
    /// Key bytes.
    pub string: usize,
    /// Header plus entry table.
    pub overhead: usize,
    /// The free gap.
    pub unused: usize,
}

/// Iteration cursor for [`Bucket::next_entry`]. External so buckets stay
/// stateless; reset with [`BucketCursor::default`] to restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketCursor {
    next: u32,
}

/// A validated view over one bucket block.
pub struct Bucket<'a> {
    block: &'a mut [u8],
    strategy: BucketStrategy,
}

impl<'a> Bucket<'a> {
    /// Write an empty bucket over `block`.
    pub fn format(block: &mut [u8], strategy: BucketStrategy) -> Result<(), StoreError> {
        if block.len() < HEADER_LEN + ENTRY_LEN || block.len() > u32::MAX as usize {
            return Err(StoreError::Invalid("block size out of range"));
        }
        let block_len = block.len();
        let (hdr, _) = BucketHeader::mut_from_prefix(block)
            .map_err(|_| StoreError::Invalid("block too small for bucket header"))?;
        hdr.entries = U32::new(0);
        hdr.value_heap_bottom = U32::new(HEADER_LEN as u32);
        hdr.string_heap_top = U32::new(block_len as u32);
        hdr.strategy = strategy as u8;
        hdr.pad = [0; 3];
        Ok(())
    }

    /// Open a view over an existing bucket, validating the header and
    /// every entry record against the block bounds.
    pub fn new(block: &'a mut [u8]) -> Result<Bucket<'a>, StoreError> {
        let len = block.len();
        if len < HEADER_LEN + ENTRY_LEN || len > u32::MAX as usize {
            return Err(StoreError::Invalid("block size out of range"));
        }
        let (hdr, _) = BucketHeader::ref_from_prefix(block)
            .map_err(|_| StoreError::Invalid("block too small for bucket header"))?;
        let strategy = BucketStrategy::from_byte(hdr.strategy)?;
        let n = hdr.entries.get() as usize;
        let vhb = hdr.value_heap_bottom.get() as usize;
        let sht = hdr.string_heap_top.get() as usize;
        let table_end = HEADER_LEN + n * ENTRY_LEN;
        if table_end > vhb || vhb > sht || sht > len {
            return Err(StoreError::Invalid("corrupt bucket header"));
        }
        let bucket = Bucket { block, strategy };
        for i in 0..n as u32 {
            let e = bucket.entry(i);
            let (so, sl) = (e.string_off.get() as usize, e.string_len.get() as usize);
            let (vo, vl) = (e.value_off.get() as usize, e.value_len.get() as usize);
            if so < sht || so + sl > len || vo < table_end || vo + vl > vhb {
                return Err(StoreError::Invalid("corrupt bucket entry"));
            }
        }
        Ok(bucket)
    }

    pub fn strategy(&self) -> BucketStrategy {
        self.strategy
    }

    pub fn entries(&self) -> u32 {
        let (hdr, _) = BucketHeader::ref_from_prefix(self.block).unwrap_or_else(|_| unreachable!());
        hdr.entries.get()
    }

    fn header(&self) -> (u32, usize, usize) {
        let (hdr, _) = BucketHeader::ref_from_prefix(self.block).unwrap_or_else(|_| unreachable!());
        (
            hdr.entries.get(),
            hdr.value_heap_bottom.get() as usize,
            hdr.string_heap_top.get() as usize,
        )
    }

    fn set_header(&mut self, entries: u32, vhb: usize, sht: usize) {
        let (hdr, _) =
            BucketHeader::mut_from_prefix(self.block).unwrap_or_else(|_| unreachable!());
        hdr.entries = U32::new(entries);
        hdr.value_heap_bottom = U32::new(vhb as u32);
        hdr.string_heap_top = U32::new(sht as u32);
    }

    fn entry(&self, i: u32) -> EntryRecord {
        let start = HEADER_LEN + i as usize * ENTRY_LEN;
        EntryRecord::read_from_bytes(&self.block[start..start + ENTRY_LEN])
            .unwrap_or_else(|_| unreachable!())
    }

    fn set_entry(&mut self, i: u32, rec: EntryRecord) {
        let start = HEADER_LEN + i as usize * ENTRY_LEN;
        rec.write_to(&mut self.block[start..start + ENTRY_LEN])
            .unwrap_or_else(|_| unreachable!());
    }

    /// Key bytes of entry `i`.
    pub fn key_at(&self, i: u32) -> &[u8] {
        let e = self.entry(i);
        let start = e.string_off.get() as usize;
        &self.block[start..start + e.string_len.get() as usize]
    }

    /// Value bytes of entry `i`.
    pub fn value_at(&self, i: u32) -> &[u8] {
        let (start, len) = self.value_range(i);
        &self.block[start..start + len]
    }

    /// Byte range of entry `i`'s value within the block.
    pub fn value_range(&self, i: u32) -> (usize, usize) {
        let e = self.entry(i);
        (e.value_off.get() as usize, e.value_len.get() as usize)
    }

    /// Byte ranges of entry `i`'s key and value within the block, for
    /// callers that need to hold both after dropping the view.
    pub fn entry_ranges(&self, i: u32) -> ((usize, usize), (usize, usize)) {
        let e = self.entry(i);
        (
            (e.string_off.get() as usize, e.string_len.get() as usize),
            (e.value_off.get() as usize, e.value_len.get() as usize),
        )
    }

    /// Locate `key`: `Ok(index)` when present, `Err(insertion index)`
    /// otherwise.
    pub fn search(&self, key: &[u8]) -> Result<u32, u32> {
        let n = self.entries();
        match self.strategy {
            BucketStrategy::FlatSorted => {
                let (mut lo, mut hi) = (0u32, n);
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    match self.key_at(mid).cmp(key) {
                        std::cmp::Ordering::Less => lo = mid + 1,
                        std::cmp::Ordering::Greater => hi = mid,
                        std::cmp::Ordering::Equal => return Ok(mid),
                    }
                }
                Err(lo)
            }
            BucketStrategy::FlatUnsorted => {
                for i in 0..n {
                    if self.key_at(i) == key {
                        return Ok(i);
                    }
                }
                Err(n)
            }
        }
    }

    /// Index of `key` if present.
    pub fn position(&self, key: &[u8]) -> Option<u32> {
        self.search(key).ok()
    }

    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        self.position(key).map(|i| {
            let (start, len) = self.value_range(i);
            &self.block[start..start + len]
        })
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut [u8]> {
        self.position(key).map(|i| {
            let (start, len) = self.value_range(i);
            &mut self.block[start..start + len]
        })
    }

    /// Reserve space for a new entry and return its zeroed value slice for
    /// the caller to fill.
    pub fn alloc(&mut self, key: &[u8], value_len: usize) -> Result<&mut [u8], StoreError> {
        let slot = match self.search(key) {
            Ok(_) => return Err(StoreError::Exists("bucket key")),
            Err(i) => i,
        };
        let (n, vhb, sht) = self.header();
        let need = ENTRY_LEN + key.len() + value_len;
        if need > sht - vhb {
            return Err(if HEADER_LEN + need > self.block.len() {
                StoreError::TooBig
            } else {
                StoreError::NoSpace("bucket")
            });
        }
        let table_end = HEADER_LEN + n as usize * ENTRY_LEN;

        // Shift the whole value heap up one table slot and re-aim the
        // records at it (the table itself has not moved yet).
        self.block.copy_within(table_end..vhb, table_end + ENTRY_LEN);
        for j in 0..n {
            let mut e = self.entry(j);
            e.value_off = U32::new(e.value_off.get() + ENTRY_LEN as u32);
            self.set_entry(j, e);
        }

        // Open the table slot.
        self.block.copy_within(
            HEADER_LEN + slot as usize * ENTRY_LEN..table_end,
            HEADER_LEN + (slot + 1) as usize * ENTRY_LEN,
        );

        // Key at the bottom of the string heap, value at the top of the
        // shifted value heap.
        let new_sht = sht - key.len();
        self.block[new_sht..sht].copy_from_slice(key);
        let value_off = vhb + ENTRY_LEN;
        self.block[value_off..value_off + value_len].fill(0);

        self.set_entry(
            slot,
            EntryRecord {
                string_off: U32::new(new_sht as u32),
                string_len: U32::new(key.len() as u32),
                value_off: U32::new(value_off as u32),
                value_len: U32::new(value_len as u32),
            },
        );
        self.set_header(n + 1, value_off + value_len, new_sht);
        Ok(&mut self.block[value_off..value_off + value_len])
    }

    /// Grow or shrink the value of entry `i` in place, preserving the
    /// common prefix. New bytes are zeroed.
    pub fn realloc_at(&mut self, i: u32, new_len: usize) -> Result<&mut [u8], StoreError> {
        let (n, vhb, sht) = self.header();
        let e = self.entry(i);
        let (vo, old_len) = (e.value_off.get() as usize, e.value_len.get() as usize);
        if new_len > old_len {
            let extra = new_len - old_len;
            if extra > sht - vhb {
                return Err(
                    if HEADER_LEN + ENTRY_LEN + e.string_len.get() as usize + new_len
                        > self.block.len()
                    {
                        StoreError::TooBig
                    } else {
                        StoreError::NoSpace("bucket")
                    },
                );
            }
        }

        // An empty value has no region of its own; its offset may coincide
        // with a neighbour's boundary. Growing one therefore claims fresh
        // space at the top of the heap rather than widening in place.
        if old_len == 0 {
            if new_len == 0 {
                return Ok(&mut self.block[vo..vo]);
            }
            let mut rec = self.entry(i);
            rec.value_off = U32::new(vhb as u32);
            rec.value_len = U32::new(new_len as u32);
            self.set_entry(i, rec);
            self.block[vhb..vhb + new_len].fill(0);
            self.set_header(n, vhb + new_len, sht);
            return Ok(&mut self.block[vhb..vhb + new_len]);
        }

        // Slide the values stacked above this one and re-aim their records.
        self.block.copy_within(vo + old_len..vhb, vo + new_len);
        for j in 0..n {
            let mut rec = self.entry(j);
            let off = rec.value_off.get() as usize;
            if j != i && off > vo {
                rec.value_off = U32::new((off + new_len - old_len) as u32);
                self.set_entry(j, rec);
            }
        }
        if new_len > old_len {
            self.block[vo + old_len..vo + new_len].fill(0);
        }
        let mut rec = self.entry(i);
        rec.value_len = U32::new(new_len as u32);
        self.set_entry(i, rec);
        self.set_header(n, vhb + new_len - old_len, sht);
        Ok(&mut self.block[vo..vo + new_len])
    }

    /// Resize the value of `key` in place.
    pub fn realloc(&mut self, key: &[u8], new_len: usize) -> Result<&mut [u8], StoreError> {
        let i = self
            .position(key)
            .ok_or(StoreError::NotFound("bucket key"))?;
        self.realloc_at(i, new_len)
    }

    /// Replace the key of entry `i` without touching its value or table
    /// slot. The caller must pick a key that keeps the table order valid.
    pub fn replace_key_at(&mut self, i: u32, new_key: &[u8]) -> Result<(), StoreError> {
        let (n, vhb, sht) = self.header();
        let e = self.entry(i);
        let (so, sl) = (e.string_off.get() as usize, e.string_len.get() as usize);
        if new_key.len() > sl && new_key.len() - sl > sht - vhb {
            return Err(StoreError::NoSpace("bucket"));
        }

        // Drop the old key bytes, then lay the new key at the bottom of
        // the heap.
        self.block.copy_within(sht..so, sht + sl);
        for j in 0..n {
            let mut rec = self.entry(j);
            let off = rec.string_off.get() as usize;
            if j != i && off < so {
                rec.string_off = U32::new((off + sl) as u32);
                self.set_entry(j, rec);
            }
        }
        let sht = sht + sl;
        let new_sht = sht - new_key.len();
        self.block[new_sht..sht].copy_from_slice(new_key);
        let mut rec = self.entry(i);
        rec.string_off = U32::new(new_sht as u32);
        rec.string_len = U32::new(new_key.len() as u32);
        self.set_entry(i, rec);
        self.set_header(n, vhb, new_sht);
        if self.strategy == BucketStrategy::FlatSorted {
            debug_assert!(i == 0 || self.key_at(i - 1) < self.key_at(i));
            debug_assert!(i + 1 >= n || self.key_at(i) < self.key_at(i + 1));
        }
        Ok(())
    }

    /// Remove entry `i`, compacting both heaps and the table.
    pub fn remove_at(&mut self, i: u32) {
        let (n, vhb, sht) = self.header();
        debug_assert!(i < n);
        let e = self.entry(i);
        let (so, sl) = (e.string_off.get() as usize, e.string_len.get() as usize);
        let (vo, vl) = (e.value_off.get() as usize, e.value_len.get() as usize);

        // Compact the value heap over the vacated slot.
        self.block.copy_within(vo + vl..vhb, vo);
        for j in 0..n {
            let mut rec = self.entry(j);
            let off = rec.value_off.get() as usize;
            if j != i && off > vo {
                rec.value_off = U32::new((off - vl) as u32);
                self.set_entry(j, rec);
            }
        }

        // Compact the string heap: slide everything below the vacated key
        // up against the block end.
        self.block.copy_within(sht..so, sht + sl);
        for j in 0..n {
            let mut rec = self.entry(j);
            let off = rec.string_off.get() as usize;
            if j != i && off < so {
                rec.string_off = U32::new((off + sl) as u32);
                self.set_entry(j, rec);
            }
        }

        // Close the table slot, then pull the value heap down over it.
        let table_end = HEADER_LEN + n as usize * ENTRY_LEN;
        self.block.copy_within(
            HEADER_LEN + (i + 1) as usize * ENTRY_LEN..table_end,
            HEADER_LEN + i as usize * ENTRY_LEN,
        );
        let new_table_end = table_end - ENTRY_LEN;
        let vhb = vhb - vl;
        self.block.copy_within(new_table_end + ENTRY_LEN..vhb, new_table_end);
        let n = n - 1;
        for j in 0..n {
            let mut rec = self.entry(j);
            rec.value_off = U32::new(rec.value_off.get() - ENTRY_LEN as u32);
            self.set_entry(j, rec);
        }
        self.set_header(n, vhb - ENTRY_LEN, sht + sl);
    }

    /// Remove the entry for `key`.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let i = self
            .position(key)
            .ok_or(StoreError::NotFound("bucket key"))?;
        self.remove_at(i);
        Ok(())
    }

    /// Next entry in table order (key order for [`BucketStrategy::FlatSorted`]).
    pub fn next_entry(&self, cursor: &mut BucketCursor) -> Option<(&[u8], &[u8])> {
        if cursor.next >= self.entries() {
            return None;
        }
        let i = cursor.next;
        cursor.next += 1;
        let e = self.entry(i);
        let (so, sl) = (e.string_off.get() as usize, e.string_len.get() as usize);
        let (vo, vl) = (e.value_off.get() as usize, e.value_len.get() as usize);
        Some((&self.block[so..so + sl], &self.block[vo..vo + vl]))
    }

    pub fn stats(&self) -> BucketStats {
        let (n, vhb, sht) = self.header();
        let table_end = HEADER_LEN + n as usize * ENTRY_LEN;
        BucketStats {
            entries: n,
            utilised: vhb - table_end,
            string: self.block.len() - sht,
            overhead: table_end,
            unused: sht - vhb,
        }
    }

    /// Bytes consumed by live entries: table records, keys and values.
    /// The block can be split or merged by comparing payloads.
    pub fn payload(&self) -> usize {
        let s = self.stats();
        s.utilised + s.string + s.overhead - HEADER_LEN
    }

    /// Bytes available for payload in a block of `block_len`.
    pub fn payload_area(block_len: usize) -> usize {
        block_len - HEADER_LEN
    }
}
