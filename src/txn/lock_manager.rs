//! Per-table FIFO lock queues.
//!
//! Ordinary reads and writes never take these locks — they rely on
//! [`crate::txn::conglomerate::Conglomerate`]'s optimistic commit
//! validation instead. This manager exists for the operations that
//! cannot be validated after the fact: schema DDL and bulk table
//! rewrites, which need exclusive access while they run.

use crate::error::{Error, Result};
use crate::types::TableId;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock mode for a single table's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Parallel access; blocks only against a waiting `Write`.
    Read,
    /// Exclusive access to the table.
    Write,
}

struct TableQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

struct QueueState {
    readers: u32,
    writer: bool,
    /// FIFO order of pending requests, so a long-waiting writer cannot be
    /// starved by a steady stream of new readers.
    pending: VecDeque<LockMode>,
}

impl TableQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                readers: 0,
                writer: false,
                pending: VecDeque::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    fn acquire(&self, mode: LockMode, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.push_back(mode);
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            let at_front = state.pending.front() == Some(&mode);
            let can_grant = at_front
                && match mode {
                    LockMode::Read => !state.writer,
                    LockMode::Write => !state.writer && state.readers == 0,
                };

            if can_grant {
                state.pending.pop_front();
                match mode {
                    LockMode::Read => state.readers += 1,
                    LockMode::Write => state.writer = true,
                }
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.pending.retain(|m| *m != mode);
                        return Err(Error::LockTimeout(format!("{mode:?} lock wait exceeded timeout")));
                    }
                    let timed_out = self.condvar.wait_for(&mut state, deadline - now).timed_out();
                    if timed_out && state.pending.front() != Some(&mode) {
                        continue;
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
    }

    fn release(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Read => state.readers = state.readers.saturating_sub(1),
            LockMode::Write => state.writer = false,
        }
        drop(state);
        self.condvar.notify_all();
    }
}

/// A connection-wide assertion that the holder is the sole writer on the
/// connection, used by schema DDL. Orthogonal to individual table locks:
/// holding it does not itself take any table's queue.
pub struct ExclusiveGuard<'a> {
    manager: &'a LockManager,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.manager.exclusive.store(false, std::sync::atomic::Ordering::SeqCst);
        self.manager.exclusive_condvar.notify_all();
    }
}

pub struct TableLockGuard<'a> {
    manager: &'a LockManager,
    table_id: TableId,
    mode: LockMode,
}

impl Drop for TableLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(queue) = self.manager.queues.get(&self.table_id) {
            queue.release(self.mode);
        }
    }
}

/// Owns one FIFO queue per table plus the connection-wide exclusive flag.
pub struct LockManager {
    queues: DashMap<TableId, Arc<TableQueue>>,
    exclusive: std::sync::atomic::AtomicBool,
    exclusive_mutex: Mutex<()>,
    exclusive_condvar: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            exclusive: std::sync::atomic::AtomicBool::new(false),
            exclusive_mutex: Mutex::new(()),
            exclusive_condvar: Condvar::new(),
        }
    }

    fn queue_for(&self, table_id: TableId) -> Arc<TableQueue> {
        self.queues
            .entry(table_id)
            .or_insert_with(|| Arc::new(TableQueue::new()))
            .clone()
    }

    /// Acquires a read or write lock on `table_id`, blocking until it is
    /// this request's turn in FIFO order. Returns a guard that releases on
    /// drop.
    pub fn lock_table(&self, table_id: TableId, mode: LockMode) -> Result<TableLockGuard<'_>> {
        self.queue_for(table_id).acquire(mode, None)?;
        Ok(TableLockGuard {
            manager: self,
            table_id,
            mode,
        })
    }

    /// Same as [`Self::lock_table`] but gives up after `timeout`.
    pub fn try_lock_table(
        &self,
        table_id: TableId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<TableLockGuard<'_>> {
        self.queue_for(table_id).acquire(mode, Some(timeout))?;
        Ok(TableLockGuard {
            manager: self,
            table_id,
            mode,
        })
    }

    /// Blocks until no other connection holds exclusive mode, then claims
    /// it. Does not touch any table's FIFO queue.
    pub fn acquire_exclusive(&self) -> ExclusiveGuard<'_> {
        let mut guard = self.exclusive_mutex.lock();
        while self
            .exclusive
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            self.exclusive_condvar.wait(&mut guard);
        }
        ExclusiveGuard { manager: self }
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.exclusive.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
