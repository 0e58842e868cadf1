//! Storage layer: the area allocator, the fixed-slot list built on it, and
//! the blob and index-set stores built on that.

pub mod blob_store;
pub mod checksum;
pub mod fixed_list;
pub mod index_set;
pub mod store;

pub use blob_store::{BlobRef, BlobStore};
pub use checksum::{Checksum, ChecksumError, ChecksumType};
pub use fixed_list::FixedRecordList;
pub use index_set::{IndexSet, IndexSetStore, IntList};
pub use store::{AreaId, Store};
