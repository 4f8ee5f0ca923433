//! Persisted tree summary record.
//!
//! Everything the tree needs besides its blocks: root address, height,
//! entry count and geometry. Lives at offset 0 of file 0 of the tree's
//! set, inside a reserved block, and carries a crc32c over the record so a
//! torn or foreign header is rejected on open.

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bucket::BucketStrategy;
use crate::error::StoreError;
use crate::types::BlockAddr;

/// Tree summary magic: "BSTM"
const META_MAGIC: u32 = 0x4253544D;
const META_VERSION: u16 = 1;

/// On-disk summary record (40 bytes, network byte order).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct TreeMetaDisk {
    magic: U32,
    version: U16,
    leaf_strategy: u8,
    node_strategy: u8,
    block_size: U32,
    root_file: U16,
    pad: [u8; 2],
    root_offset: U64,
    height: U32,
    entries: U64,
    crc: U32,
}

pub(crate) const META_LEN: usize = size_of::<TreeMetaDisk>();
/// Bytes covered by the trailing crc.
const META_CRC_LEN: usize = META_LEN - size_of::<U32>();

/// Decoded summary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMeta {
    pub block_size: u32,
    pub leaf_strategy: BucketStrategy,
    pub node_strategy: BucketStrategy,
    pub root: BlockAddr,
    pub height: u32,
    pub entries: u64,
}

impl TreeMeta {
    /// Parse and verify a summary record from the header block.
    pub fn from_block(buf: &[u8]) -> Result<Self, StoreError> {
        let (disk, _) = TreeMetaDisk::ref_from_prefix(buf)
            .map_err(|_| StoreError::Invalid("header block too small for tree summary"))?;
        if disk.magic.get() != META_MAGIC {
            return Err(StoreError::BadMagic("tree summary"));
        }
        if disk.version.get() != META_VERSION {
            return Err(StoreError::Invalid("unsupported tree summary version"));
        }
        if disk.crc.get() != crc32c::crc32c(&buf[..META_CRC_LEN]) {
            return Err(StoreError::CrcMismatch("tree summary"));
        }
        Ok(TreeMeta {
            block_size: disk.block_size.get(),
            leaf_strategy: BucketStrategy::from_byte(disk.leaf_strategy)?,
            node_strategy: BucketStrategy::from_byte(disk.node_strategy)?,
            root: BlockAddr::new(disk.root_file.get(), disk.root_offset.get()),
            height: disk.height.get(),
            entries: disk.entries.get(),
        })
    }

    /// Serialise into the start of the header block.
    pub fn write_to_block(&self, buf: &mut [u8]) -> Result<(), StoreError> {
        if buf.len() < META_LEN {
            return Err(StoreError::Invalid("header block too small for tree summary"));
        }
        let disk = TreeMetaDisk {
            magic: U32::new(META_MAGIC),
            version: U16::new(META_VERSION),
            leaf_strategy: self.leaf_strategy as u8,
            node_strategy: self.node_strategy as u8,
            block_size: U32::new(self.block_size),
            root_file: U16::new(self.root.file),
            pad: [0; 2],
            root_offset: U64::new(self.root.offset),
            height: U32::new(self.height),
            entries: U64::new(self.entries),
            crc: U32::new(0),
        };
        disk.write_to(&mut buf[..META_LEN])
            .map_err(|_| StoreError::Invalid("header block too small for tree summary"))?;
        let crc = crc32c::crc32c(&buf[..META_CRC_LEN]);
        buf[META_CRC_LEN..META_LEN].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }
}
