//! Transaction coordination: the conglomerate commit protocol, per-table
//! locking for DDL, and sequence generators.

pub mod conglomerate;
pub mod lock_manager;
pub mod sequence;

pub use conglomerate::{Conglomerate, Transaction};
pub use lock_manager::{ExclusiveGuard, LockManager, LockMode, TableLockGuard};
pub use sequence::SequenceManager;
