//! Durable named counters, cached in memory between periodic persists so a
//! `next()` call rarely has to touch the backing table.
//!
//! Changes to a sequence are never rolled back if the enclosing transaction
//! aborts: a generator's `current_in_memory` only ever moves forward,
//! treated as outside any transaction's write set. Durability is whole-file,
//! mirroring the catalog's `catalog.bin`: every watermark advance rewrites
//! `sequences.bin` in full rather than appending a record per generator.

use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// The durable fields of one generator, as written to `sequences.bin`.
/// `current_in_memory` is deliberately excluded: on reload it restarts at
/// `last_persisted`, which is always >= the last value actually handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeneratorRow {
    increment: i64,
    min: i64,
    max: i64,
    cycle: bool,
    cache: i64,
    last_persisted: i64,
}

/// One named counter's durable and in-memory bookkeeping.
struct Generator {
    increment: i64,
    min: i64,
    max: i64,
    cycle: bool,
    cache: i64,
    /// The highest value ever durably persisted; on restart, `next()` must
    /// not hand out anything <= this without first persisting further.
    last_persisted: AtomicI64,
    current_in_memory: AtomicI64,
}

impl Generator {
    fn to_row(&self) -> GeneratorRow {
        GeneratorRow {
            increment: self.increment,
            min: self.min,
            max: self.max,
            cycle: self.cycle,
            cache: self.cache,
            last_persisted: self.last_persisted.load(Ordering::SeqCst),
        }
    }
}

impl Generator {
    fn advance(&self) -> Result<i64> {
        let next = self.current_in_memory.fetch_add(self.increment, Ordering::SeqCst) + self.increment;
        if next > self.max {
            if self.cycle {
                let wrapped = self.min;
                self.current_in_memory.store(wrapped, Ordering::SeqCst);
                return Ok(wrapped);
            }
            return Err(Error::SequenceOutOfBounds(format!(
                "sequence exhausted its range [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(next)
    }
}

/// Per-connection view of the last value `next()` returned, so `cur()` can
/// answer without a shared lock.
pub struct SequenceManager {
    generators: DashMap<String, Generator>,
    last_handed_out: DashMap<String, i64>,
    persist_path: Option<PathBuf>,
}

impl SequenceManager {
    /// In-memory only; sequences do not survive process restart. Used by
    /// callers that manage their own durability (tests, embedded use).
    pub fn new() -> Self {
        Self {
            generators: DashMap::new(),
            last_handed_out: DashMap::new(),
            persist_path: None,
        }
    }

    /// Loads generator definitions and watermarks from `sequences.bin` in
    /// `data_dir`, if present. `current_in_memory` for every reloaded
    /// generator starts at its persisted watermark: values between the
    /// last value actually handed out before the crash and the watermark
    /// are skipped, never reused.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let persist_path = data_dir.as_ref().join("sequences.bin");
        let generators = DashMap::new();

        if persist_path.exists() {
            let data = fs::read(&persist_path)?;
            let rows: std::collections::HashMap<String, GeneratorRow> = bincode::deserialize(&data)?;
            for (name, row) in rows {
                generators.insert(
                    name,
                    Generator {
                        increment: row.increment,
                        min: row.min,
                        max: row.max,
                        cycle: row.cycle,
                        cache: row.cache,
                        last_persisted: AtomicI64::new(row.last_persisted),
                        current_in_memory: AtomicI64::new(row.last_persisted - row.increment),
                    },
                );
            }
        }

        Ok(Self {
            generators,
            last_handed_out: DashMap::new(),
            persist_path: Some(persist_path),
        })
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else { return Ok(()) };
        let rows: std::collections::HashMap<String, GeneratorRow> =
            self.generators.iter().map(|e| (e.key().clone(), e.value().to_row())).collect();
        let data = bincode::serialize(&rows)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Registers a generator, typically on table open after reading its row
    /// from the `SEQUENCE_INFO` / `SEQUENCE` system tables.
    pub fn define(
        &self,
        name: &str,
        start: i64,
        increment: i64,
        min: i64,
        max: i64,
        cache: i64,
        cycle: bool,
    ) -> Result<()> {
        if self.generators.contains_key(name) {
            return Err(Error::InvalidArgument(format!("sequence '{name}' already defined")));
        }
        self.generators.insert(
            name.to_string(),
            Generator {
                increment,
                min,
                max,
                cycle,
                cache,
                last_persisted: AtomicI64::new(start),
                current_in_memory: AtomicI64::new(start - increment),
            },
        );
        self.persist()
    }

    /// Advances the sequence and returns the new value. When the in-memory
    /// counter would cross the last persisted watermark, the watermark is
    /// advanced by `cache * increment` and flushed to `sequences.bin` first,
    /// so a crash can never make `next()` hand out the same value twice.
    pub fn next(&self, name: &str) -> Result<i64> {
        let crossed = {
            let generator = self
                .generators
                .get(name)
                .ok_or_else(|| Error::InvalidArgument(format!("no such sequence '{name}'")))?;

            let would_be = generator.current_in_memory.load(Ordering::SeqCst) + generator.increment;
            if would_be > generator.last_persisted.load(Ordering::SeqCst) {
                let advance = generator.cache.max(1) * generator.increment;
                generator.last_persisted.fetch_add(advance, Ordering::SeqCst);
                true
            } else {
                false
            }
        };
        if crossed {
            self.persist()?;
        }

        let generator = self
            .generators
            .get(name)
            .ok_or_else(|| Error::InvalidArgument(format!("no such sequence '{name}'")))?;
        let value = generator.advance()?;
        self.last_handed_out.insert(name.to_string(), value);
        Ok(value)
    }

    /// The last value `next()` returned for `name`, or `InvalidArgument` if
    /// nothing has been drawn from it yet in this process.
    pub fn cur(&self, name: &str) -> Result<i64> {
        self.last_handed_out
            .get(name)
            .map(|v| *v)
            .ok_or_else(|| Error::InvalidArgument(format!("sequence '{name}' has not been drawn from yet")))
    }

    pub fn last_persisted(&self, name: &str) -> Result<i64> {
        self.generators
            .get(name)
            .map(|g| g.last_persisted.load(Ordering::SeqCst))
            .ok_or_else(|| Error::InvalidArgument(format!("no such sequence '{name}'")))
    }
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_increments() {
        let seqs = SequenceManager::new();
        seqs.define("orders_id", 1, 1, 1, i64::MAX, 10, false).unwrap();

        assert_eq!(seqs.next("orders_id").unwrap(), 1);
        assert_eq!(seqs.next("orders_id").unwrap(), 2);
        assert_eq!(seqs.cur("orders_id").unwrap(), 2);
    }

    #[test]
    fn test_cur_before_next_is_an_error() {
        let seqs = SequenceManager::new();
        seqs.define("orders_id", 1, 1, 1, i64::MAX, 10, false).unwrap();
        assert!(seqs.cur("orders_id").is_err());
    }

    #[test]
    fn test_exhausted_range_without_cycle_errors() {
        let seqs = SequenceManager::new();
        seqs.define("small", 1, 1, 1, 2, 10, false).unwrap();
        assert_eq!(seqs.next("small").unwrap(), 1);
        assert_eq!(seqs.next("small").unwrap(), 2);
        let err = seqs.next("small").unwrap_err();
        assert!(matches!(err, Error::SequenceOutOfBounds(_)));
    }

    #[test]
    fn test_cycle_wraps_to_min() {
        let seqs = SequenceManager::new();
        seqs.define("cyclic", 1, 1, 1, 2, 10, true).unwrap();
        assert_eq!(seqs.next("cyclic").unwrap(), 1);
        assert_eq!(seqs.next("cyclic").unwrap(), 2);
        assert_eq!(seqs.next("cyclic").unwrap(), 1);
    }

    #[test]
    fn test_watermark_advances_by_cache_times_increment() {
        let seqs = SequenceManager::new();
        seqs.define("batched", 1, 1, 1, i64::MAX, 5, false).unwrap();
        assert_eq!(seqs.last_persisted("batched").unwrap(), 1);
        seqs.next("batched").unwrap();
        assert_eq!(seqs.last_persisted("batched").unwrap(), 6);
    }

    #[test]
    fn test_reload_never_reissues_a_handed_out_value() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let seqs = SequenceManager::open(dir.path()).unwrap();
            seqs.define("orders_id", 1, 1, 1, i64::MAX, 5, false).unwrap();
            seqs.next("orders_id").unwrap()
        };

        let seqs = SequenceManager::open(dir.path()).unwrap();
        let resumed = seqs.next("orders_id").unwrap();
        assert!(resumed > last);
    }

    #[test]
    fn test_reload_with_no_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let seqs = SequenceManager::open(dir.path()).unwrap();
        assert!(seqs.cur("anything").is_err());
    }
}
