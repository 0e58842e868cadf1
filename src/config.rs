//! Database configuration and durability levels.
//!
//! Balances write durability against throughput: every knob here maps to a
//! configuration option a host process can set before opening a conglomerate.

use serde::{Deserialize, Serialize};

/// Durability level for the Store's write-ahead journal.
///
/// - `Synchronous`: every `flush()` calls `fsync` before returning. Safest, slowest.
/// - `GroupCommit`: concurrent committers share a single `fsync`.
/// - `Periodic`: a background interval forces `fsync`; bounded data loss on crash.
/// - `NoSync`: never calls `fsync`; for tests and throwaway databases only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    Synchronous,
    GroupCommit {
        max_batch_size: usize,
        max_wait_us: u64,
    },
    Periodic {
        interval_ms: u64,
    },
    NoSync,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::Synchronous
    }
}

impl DurabilityLevel {
    pub fn group_commit() -> Self {
        Self::GroupCommit {
            max_batch_size: 1000,
            max_wait_us: 1000,
        }
    }

    pub fn periodic(interval_ms: u64) -> Self {
        Self::Periodic { interval_ms }
    }

    /// Whether `flush()` must durably sync before returning to the caller.
    pub fn requires_immediate_sync(&self) -> bool {
        matches!(self, Self::Synchronous)
    }

    pub fn is_no_sync(&self) -> bool {
        matches!(self, Self::NoSync)
    }
}

/// Top-level configuration for an open conglomerate.
///
/// Field names track the recognized configuration options from the external
/// interface table: each one is read by exactly one component below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DBConfig {
    /// Root directory for all table stores.
    pub database_path: String,

    /// Disables all write latches; any commit attempt fails immediately.
    pub read_only: bool,

    /// Byte budget for the cell cache.
    pub data_cache_size: usize,

    /// Upper bound on a single cached cell's encoded size; larger values bypass the cache.
    pub max_cache_entry_size: usize,

    /// Size of the user-command worker pool.
    pub maximum_worker_threads: usize,

    /// Elides `fsync` after a commit flush. Unsafe; overrides `durability_level`.
    pub dont_synch_filesystem: bool,

    /// Governs how aggressively the write-ahead journal is synced when
    /// `dont_synch_filesystem` is false.
    pub durability_level: DurabilityLevel,

    /// Enables read-set revalidation at commit time (`DirtySelect`).
    pub transaction_error_on_dirty_select: bool,

    /// Table/column name comparisons become case-insensitive.
    pub ignore_case_for_identifiers: bool,

    /// Enables runtime lock-discipline assertions (double-release, wrong-order acquire).
    pub table_lock_check: bool,

    /// Bounds for `IndexSetStore` block size (entries per block).
    pub index_block_size: usize,

    /// Bounds for the RID-list rehash threshold (open question, resolved in DESIGN.md);
    /// valid range is 8..16384.
    pub rid_rehash_threshold: usize,
}

impl Default for DBConfig {
    fn default() -> Self {
        Self {
            database_path: "./data".to_string(),
            read_only: false,
            data_cache_size: 16 * 1024 * 1024,
            max_cache_entry_size: 64 * 1024,
            maximum_worker_threads: 4,
            dont_synch_filesystem: false,
            durability_level: DurabilityLevel::default(),
            transaction_error_on_dirty_select: false,
            ignore_case_for_identifiers: false,
            table_lock_check: false,
            index_block_size: 512,
            rid_rehash_threshold: 256,
        }
    }
}

impl DBConfig {
    pub fn for_testing() -> Self {
        Self {
            durability_level: DurabilityLevel::NoSync,
            dont_synch_filesystem: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if !(8..=16384).contains(&self.rid_rehash_threshold) {
            return Err(crate::error::Error::InvalidArgument(format!(
                "rid_rehash_threshold {} out of bounds 8..16384",
                self.rid_rehash_threshold
            )));
        }
        if !(8..=32768).contains(&self.index_block_size) {
            return Err(crate::error::Error::InvalidArgument(format!(
                "index_block_size {} out of bounds 8..32768",
                self.index_block_size
            )));
        }
        Ok(())
    }
}
