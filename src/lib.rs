//! Storage and transaction core for an embedded relational database.
//!
//! Layered bottom-up:
//! - [`storage`]: the area allocator (`Store`), the fixed-slot list built on
//!   it (`FixedRecordList`), and the blob and multi-snapshot index-set
//!   stores built on that.
//! - [`table`]: per-table storage (`MasterTableDataSource`), the in-memory
//!   transaction journal, and the process-wide cell cache.
//! - [`catalog`]: the durable name -> schema registry.
//! - [`txn`]: the conglomerate commit protocol, per-table DDL locking, and
//!   sequence generators.
//! - [`gc`]: the background dispatcher that reclaims space and builds
//!   deferred indices.
//! - [`engine`]: the `Database` handle tying all of the above together.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod gc;
pub mod storage;
pub mod table;
pub mod txn;
pub mod types;

mod error;

pub use config::{DBConfig, DurabilityLevel};
pub use engine::Database;
pub use error::{Error, Result};
pub use types::{BlobId, CommitId, Row, RowId, TableId, Value};
