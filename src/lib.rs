pub mod bucket;
pub mod error;
pub mod fileset;
pub mod freemap;
pub mod getopt;
pub mod rbtree;
pub mod tree;
pub mod types;

mod cache;
mod meta;

pub use bucket::{Bucket, BucketCursor, BucketStats, BucketStrategy};
pub use error::StoreError;
pub use fileset::{FileFactory, FileSet, SetId};
pub use freemap::{FileSource, FreeMap, FreeMapStats, NoGrow, Strategy};
pub use getopt::{ArgStyle, OptMatch, OptParser, OptSpec};
pub use rbtree::{RbTree, Traversal};
pub use tree::{Iobtree, TreeCursor, TreeOptions};
pub use types::{BlockAddr, Extent, FileId};
