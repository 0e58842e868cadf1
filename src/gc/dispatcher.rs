//! Single background worker draining a min-heap of `(run_after, task)`.
//!
//! Holds only a `Weak<Conglomerate>` so the worker thread never keeps the
//! database alive past the last `Database` handle: it upgrades the weak
//! reference on every tick and exits quietly once that fails.

use crate::txn::Conglomerate;
use crate::types::TableId;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One unit of deferred background work.
#[derive(Debug, Clone)]
pub enum Task {
    RowCollect,
    CellCacheTrim,
    RidListBuild { table_id: TableId, list_number: usize, column: usize },
}

struct Scheduled {
    run_at: Instant,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at
    }
}
impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest `run_at` sorts first.
        other.run_at.cmp(&self.run_at)
    }
}

/// Owns the task heap and the worker thread. Dropping the dispatcher signals
/// shutdown and joins the thread.
pub struct Dispatcher {
    heap: Arc<Mutex<BinaryHeap<Scheduled>>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the worker thread. `conglomerate` is held weakly: once every
    /// strong reference (held by the owning `Database`) drops, the worker
    /// exits on its next wake.
    pub fn spawn(conglomerate: &Arc<Conglomerate>) -> Self {
        let heap: Arc<Mutex<BinaryHeap<Scheduled>>> = Arc::new(Mutex::new(BinaryHeap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let heap_weak = Arc::downgrade(&heap);
        let shutdown_weak = Arc::downgrade(&shutdown);
        let conglomerate_weak = Arc::downgrade(conglomerate);

        let worker = thread::spawn(move || {
            let mut idle_ticks = 0u32;
            loop {
                let shutdown = match shutdown_weak.upgrade() {
                    Some(s) => s,
                    None => break,
                };
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let heap = match heap_weak.upgrade() {
                    Some(h) => h,
                    None => break,
                };
                let conglomerate = match conglomerate_weak.upgrade() {
                    Some(c) => c,
                    None => break,
                };

                let due = {
                    let mut guard = heap.lock().unwrap();
                    match guard.peek() {
                        Some(s) if s.run_at <= Instant::now() => guard.pop().map(|s| s.task),
                        _ => None,
                    }
                };

                match due {
                    Some(task) => {
                        idle_ticks = 0;
                        run_task(&conglomerate, task);
                    }
                    None => {
                        idle_ticks = idle_ticks.saturating_add(1);
                        let backoff = match idle_ticks {
                            0..=10 => Duration::from_millis(50),
                            11..=30 => Duration::from_millis(200),
                            _ => Duration::from_secs(1),
                        };
                        thread::sleep(backoff);
                    }
                }
            }
        });

        Self {
            heap,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Schedules `task` to run no sooner than `delay` from now.
    pub fn schedule(&self, task: Task, delay: Duration) {
        let mut guard = self.heap.lock().unwrap();
        guard.push(Scheduled { run_at: Instant::now() + delay, task });
    }

    pub fn pending_count(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}

fn run_task(conglomerate: &Arc<Conglomerate>, task: Task) {
    match task {
        Task::RowCollect => {
            if let Err(e) = conglomerate.collect_garbage() {
                eprintln!("dispatcher: row collect failed: {e}");
            }
        }
        Task::CellCacheTrim => {
            // The cell cache evicts to its byte budget on every `put`;
            // nothing to do here beyond giving a schedule point future
            // cache strategies can hook into.
        }
        Task::RidListBuild { table_id, list_number, column } => {
            if let Err(e) = conglomerate.rebuild_index(table_id, list_number, column) {
                eprintln!("dispatcher: rid-list build failed for table {table_id} list {list_number}: {e}");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CellCache;
    use crate::types::{ColumnDef, ColumnType, TableSchema, Value};
    use std::sync::Arc;

    fn conglomerate_with_table(dir: &std::path::Path) -> Arc<Conglomerate> {
        let cache = Arc::new(CellCache::new(1 << 20, 1 << 16));
        let conglomerate = Arc::new(Conglomerate::new(cache.clone()));
        let schema = TableSchema::new(
            "t".into(),
            vec![ColumnDef::new("id".into(), ColumnType::Integer, 0)],
        );
        let table = crate::table::MasterTableDataSource::create(dir.join("t.store"), 1, schema, cache).unwrap();
        conglomerate.register_table(1, table);
        conglomerate
    }

    #[test]
    fn test_row_collect_task_runs() {
        let dir = tempfile::tempdir().unwrap();
        let conglomerate = conglomerate_with_table(dir.path());

        let tx = conglomerate.begin_transaction(false);
        let row_index = conglomerate.add_row(&tx, 1, vec![Value::Integer(1)]).unwrap();
        conglomerate.commit(&tx).unwrap();
        let tx2 = conglomerate.begin_transaction(false);
        conglomerate.remove_row(&tx2, 1, row_index).unwrap();
        conglomerate.commit(&tx2).unwrap();

        let dispatcher = Dispatcher::spawn(&conglomerate);
        dispatcher.schedule(Task::RowCollect, Duration::from_millis(0));
        thread::sleep(Duration::from_millis(200));
        drop(dispatcher);

        let reader = conglomerate.begin_transaction(true);
        assert_eq!(
            conglomerate.get_cell(&reader, 1, row_index, 0).unwrap_err().to_string().contains("does not exist"),
            true
        );
    }

    #[test]
    fn test_dispatcher_drops_cleanly_with_no_pending_work() {
        let dir = tempfile::tempdir().unwrap();
        let conglomerate = conglomerate_with_table(dir.path());
        let dispatcher = Dispatcher::spawn(&conglomerate);
        assert_eq!(dispatcher.pending_count(), 0);
        drop(dispatcher);
    }

    #[test]
    fn test_worker_exits_when_conglomerate_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let conglomerate = conglomerate_with_table(dir.path());
        let dispatcher = Dispatcher::spawn(&conglomerate);
        drop(conglomerate);
        thread::sleep(Duration::from_millis(100));
        drop(dispatcher);
    }
}
