//! The serialization point: owns every open table, the registry of open
//! transactions, and the optimistic commit protocol (validate, apply,
//! persist, publish).

use crate::error::{Error, Result};
use crate::table::journal::{JournalOp, TransactionJournal};
use crate::table::{CellCache, MasterTableDataSource};
use crate::types::{CommitId, ForeignKeyDef, RowId, TableId, Value};
use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TransactionState {
    Active = 0,
    Committed = 1,
    RolledBack = 2,
}

/// One open transaction's journal, base snapshot, and bookkeeping.
pub struct Transaction {
    pub id: u64,
    pub base_commit_id: CommitId,
    pub readonly: bool,
    pub journal: TransactionJournal,
    state: AtomicU8,
}

impl Transaction {
    fn new(id: u64, base_commit_id: CommitId, readonly: bool) -> Self {
        Self {
            id,
            base_commit_id,
            readonly,
            journal: TransactionJournal::new(),
            state: AtomicU8::new(TransactionState::Active as u8),
        }
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == TransactionState::Active as u8
    }
}

struct CommittedJournal {
    commit_id: CommitId,
    table_id: TableId,
    entries: Vec<crate::table::journal::JournalEntry>,
}

/// Owns every table's [`MasterTableDataSource`] and arbitrates commits
/// through a single-writer lock. All table mutation flows through here;
/// a `MasterTableDataSource` never validates against concurrent writers
/// on its own.
pub struct Conglomerate {
    tables: RwLock<AHashMap<TableId, Mutex<MasterTableDataSource>>>,
    open_transactions: DashMap<u64, CommitId>,
    committed_journals: Mutex<Vec<CommittedJournal>>,
    commit_lock: Mutex<()>,
    next_commit_id: AtomicU64,
    next_tx_id: AtomicU64,
    cache: Arc<CellCache>,
}

impl Conglomerate {
    pub fn new(cache: Arc<CellCache>) -> Self {
        Self {
            tables: RwLock::new(AHashMap::new()),
            open_transactions: DashMap::new(),
            committed_journals: Mutex::new(Vec::new()),
            commit_lock: Mutex::new(()),
            next_commit_id: AtomicU64::new(1),
            next_tx_id: AtomicU64::new(1),
            cache,
        }
    }

    pub fn register_table(&self, table_id: TableId, table: MasterTableDataSource) {
        self.tables.write().insert(table_id, Mutex::new(table));
    }

    pub fn deregister_table(&self, table_id: TableId) {
        self.tables.write().remove(&table_id);
        self.cache.invalidate_table(table_id);
    }

    pub fn current_commit_id(&self) -> CommitId {
        self.next_commit_id.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// The oldest base commit id among still-open transactions, or the
    /// current commit id if none are open. Rows removed before this point
    /// are unreachable from any live snapshot and are safe to `collect`.
    pub fn oldest_live_commit_id(&self) -> CommitId {
        self.open_transactions
            .iter()
            .map(|e| *e.value())
            .min()
            .unwrap_or_else(|| self.current_commit_id())
    }

    pub fn begin_transaction(&self, readonly: bool) -> Arc<Transaction> {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let base_commit_id = self.current_commit_id();
        self.open_transactions.insert(id, base_commit_id);
        Arc::new(Transaction::new(id, base_commit_id, readonly))
    }

    pub fn close_transaction(&self, tx: &Transaction) {
        self.open_transactions.remove(&tx.id);
    }

    /// Unwinds every row-level change this transaction made against its
    /// tables, then flips it to rolled back. An uncommitted add is freed as
    /// if it had never existed; an uncommitted remove is restored to
    /// COMMITTED_ADDED so it stays visible to everyone else. Table lookups
    /// that fail (e.g. a table dropped mid-transaction) are swallowed: there
    /// is nothing left to unwind against.
    pub fn rollback(&self, tx: &Transaction) {
        for table_id in tx.journal.touched_tables() {
            let changes = tx.journal.per_table_row_changes(table_id);
            let _ = self.with_table(table_id, |table| {
                for (op, row_index) in &changes {
                    match op {
                        JournalOp::AddRow => table.undo_add(*row_index)?,
                        JournalOp::RemoveRow => table.undo_remove(*row_index)?,
                        _ => {}
                    }
                }
                Ok(())
            });
        }
        tx.state.store(TransactionState::RolledBack as u8, Ordering::Release);
        self.close_transaction(tx);
    }

    fn table_id_by_name(&self, name: &str) -> Option<TableId> {
        self.tables
            .read()
            .iter()
            .find(|(_, t)| t.lock().schema().name == name)
            .map(|(id, _)| *id)
    }

    fn with_table<R>(&self, table_id: TableId, f: impl FnOnce(&mut MasterTableDataSource) -> Result<R>) -> Result<R> {
        let tables = self.tables.read();
        let table = tables
            .get(&table_id)
            .ok_or_else(|| Error::TableNotFound(format!("table {table_id}")))?;
        let result = f(&mut table.lock());
        result
    }

    pub fn add_row(&self, tx: &Transaction, table_id: TableId, row: crate::types::Row) -> Result<RowId> {
        self.with_table(table_id, |t| t.add_row(&row, &tx.journal))
    }

    pub fn remove_row(&self, tx: &Transaction, table_id: TableId, row_index: RowId) -> Result<()> {
        self.with_table(table_id, |t| t.remove_row(row_index, &tx.journal))
    }

    /// Reads one cell through `tx`'s snapshot: visible if this transaction
    /// itself wrote the row (committed or not), or if the row was durably
    /// committed at or before `tx.base_commit_id` and not yet removed as of
    /// that point.
    pub fn get_cell(&self, tx: &Transaction, table_id: TableId, row_index: RowId, column: usize) -> Result<Value> {
        let own_write = tx
            .journal
            .per_table_row_changes(table_id)
            .iter()
            .any(|(_, r)| *r == row_index);
        self.with_table(table_id, |t| t.get_cell(row_index, column, tx.base_commit_id as i64, own_write))
    }

    /// Runs the validate -> apply -> persist -> publish protocol under the
    /// single-writer commit lock.
    pub fn commit(&self, tx: &Transaction) -> Result<CommitId> {
        if !tx.is_active() {
            return Err(Error::InvalidArgument(format!("transaction {} is not active", tx.id)));
        }
        if tx.journal.is_empty() {
            self.close_transaction(tx);
            tx.state.store(TransactionState::Committed as u8, Ordering::Release);
            return Ok(tx.base_commit_id);
        }

        let _guard = self.commit_lock.lock();

        let touched = tx.journal.touched_tables();
        let concurrent = self.journals_since(tx.base_commit_id, &touched);
        self.validate(tx, &concurrent)?;

        let commit_id = self.next_commit_id.fetch_add(1, Ordering::SeqCst);
        self.apply(tx, commit_id)?;

        let mut committed = self.committed_journals.lock();
        for table_id in &touched {
            committed.push(CommittedJournal {
                commit_id,
                table_id: *table_id,
                entries: tx.journal.per_table_row_changes(*table_id).into_iter().map(|(op, row_index)| {
                    crate::table::journal::JournalEntry { op, table_id: *table_id, row_index: Some(row_index) }
                }).collect(),
            });
        }
        drop(committed);

        tx.state.store(TransactionState::Committed as u8, Ordering::Release);
        self.close_transaction(tx);
        Ok(commit_id)
    }

    fn journals_since(&self, base_commit_id: CommitId, touched: &[TableId]) -> Vec<(TableId, RowId, JournalOp)> {
        let committed = self.committed_journals.lock();
        committed
            .iter()
            .filter(|j| j.commit_id > base_commit_id && touched.contains(&j.table_id))
            .flat_map(|j| j.entries.iter().filter_map(|e| e.row_index.map(|r| (j.table_id, r, e.op))))
            .collect()
    }

    /// Write-write conflict: a row this transaction removed was also
    /// removed or updated by a transaction that committed after its base.
    /// Uniqueness is checked against the union of this transaction's
    /// additions and the table's currently committed rows, and every
    /// declared foreign key is checked against the referenced table's
    /// currently committed rows.
    fn validate(&self, tx: &Transaction, concurrent: &[(TableId, RowId, JournalOp)]) -> Result<()> {
        for entry in tx.journal.entries() {
            if entry.op != JournalOp::RemoveRow {
                continue;
            }
            let row_index = entry.row_index.unwrap();
            let conflict = concurrent.iter().any(|(table_id, r, op)| {
                *table_id == entry.table_id && *r == row_index && *op == JournalOp::RemoveRow
            });
            if conflict {
                return Err(Error::ReadWriteConflict(format!(
                    "row {row_index} in table {} was concurrently removed",
                    entry.table_id
                )));
            }
        }

        for table_id in tx.journal.touched_tables() {
            self.validate_unique_columns(tx, table_id)?;
            self.validate_foreign_keys(tx, table_id)?;
        }
        Ok(())
    }

    fn validate_unique_columns(&self, tx: &Transaction, table_id: TableId) -> Result<()> {
        let changes = tx.journal.per_table_row_changes(table_id);
        let added_rows: Vec<RowId> = changes.iter().filter(|(op, _)| *op == JournalOp::AddRow).map(|(_, r)| *r).collect();
        let removed_rows: Vec<RowId> =
            changes.iter().filter(|(op, _)| *op == JournalOp::RemoveRow).map(|(_, r)| *r).collect();
        if added_rows.is_empty() {
            return Ok(());
        }

        self.with_table(table_id, |table| {
            let unique_columns: Vec<usize> = table
                .schema()
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.unique)
                .map(|(i, _)| i)
                .collect();
            if unique_columns.is_empty() {
                return Ok(());
            }

            for &column in &unique_columns {
                let mut seen = Vec::with_capacity(added_rows.len());
                for &row_index in &added_rows {
                    let value = table.get_cell(row_index, column, tx.base_commit_id as i64, true)?;
                    if matches!(value, Value::Null) {
                        continue;
                    }
                    if seen.contains(&value) {
                        return Err(Error::UniqueViolation(format!(
                            "duplicate value in column {column} of table {table_id} within the same transaction"
                        )));
                    }
                    seen.push(value);
                }

                for (committed_row, value) in table.scan_committed_column(column)? {
                    if removed_rows.contains(&committed_row) || matches!(value, Value::Null) {
                        continue;
                    }
                    if seen.contains(&value) {
                        return Err(Error::UniqueViolation(format!(
                            "duplicate value in column {column} of table {table_id} conflicts with a committed row"
                        )));
                    }
                }
            }
            Ok(())
        })
    }

    fn validate_foreign_keys(&self, tx: &Transaction, table_id: TableId) -> Result<()> {
        let added_rows: Vec<RowId> = tx
            .journal
            .per_table_row_changes(table_id)
            .into_iter()
            .filter(|(op, _)| *op == JournalOp::AddRow)
            .map(|(_, r)| r)
            .collect();
        if added_rows.is_empty() {
            return Ok(());
        }

        let fks: Vec<ForeignKeyDef> = self.with_table(table_id, |table| Ok(table.schema().foreign_keys.clone()))?;
        if fks.is_empty() {
            return Ok(());
        }

        for fk in &fks {
            let referenced_table_id = self.table_id_by_name(&fk.referenced_table).ok_or_else(|| {
                Error::ReferentialViolation(format!(
                    "foreign key '{}' references unknown table '{}'",
                    fk.name, fk.referenced_table
                ))
            })?;

            let values: Vec<Value> = self.with_table(table_id, |table| {
                let column = table.schema().get_column_position(&fk.column_name).ok_or_else(|| {
                    Error::ColumnNotFound(format!("{}.{}", table.schema().name, fk.column_name))
                })?;
                added_rows
                    .iter()
                    .map(|&row_index| table.get_cell(row_index, column, tx.base_commit_id as i64, true))
                    .collect()
            })?;

            self.with_table(referenced_table_id, |ref_table| {
                let ref_column = ref_table.schema().get_column_position(&fk.referenced_column).ok_or_else(|| {
                    Error::ColumnNotFound(format!("{}.{}", fk.referenced_table, fk.referenced_column))
                })?;
                let committed = ref_table.scan_committed_column(ref_column)?;
                for value in &values {
                    if matches!(value, Value::Null) {
                        continue;
                    }
                    if !committed.iter().any(|(_, v)| v == value) {
                        return Err(Error::ReferentialViolation(format!(
                            "value in column '{}' has no matching row in '{}.{}'",
                            fk.column_name, fk.referenced_table, fk.referenced_column
                        )));
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, commit_id: CommitId) -> Result<()> {
        let touched = tx.journal.touched_tables();
        for table_id in touched {
            let changes = tx.journal.per_table_row_changes(table_id);
            self.with_table(table_id, |table| {
                let mut snapshot = table.snapshot_indices()?;
                {
                    let mut master_index = snapshot.get_index(0)?;
                    for (op, row_index) in &changes {
                        match op {
                            JournalOp::AddRow => master_index.insert(*row_index as i32),
                            JournalOp::RemoveRow => {
                                master_index.remove(*row_index as i32);
                            }
                            _ => {}
                        }
                    }
                }
                table.index_store().commit(snapshot)?;

                for (op, row_index) in &changes {
                    match op {
                        JournalOp::AddRow => table.apply_commit(*row_index, true, commit_id as i64)?,
                        JournalOp::RemoveRow => table.apply_commit(*row_index, false, commit_id as i64)?,
                        _ => {}
                    }
                }
                table.flush()
            })?;
        }
        Ok(())
    }

    /// Rebuilds a secondary index list from scratch: walks the master
    /// row-membership index (list 0), reads `column` for every live row,
    /// and reinserts the row into `list_number` ordered by that column's
    /// integer value truncated to `i32` (the same truncation every
    /// `IndexSetStore` list is subject to). Intended for the dispatcher's
    /// lazy RID-list build task, not for routine per-commit maintenance.
    pub fn rebuild_index(&self, table_id: TableId, list_number: usize, column: usize) -> Result<()> {
        let now = self.current_commit_id() as i64;
        self.with_table(table_id, |table| {
            let row_indices: Vec<RowId> = {
                let mut snapshot = table.snapshot_indices()?;
                let master = snapshot.get_index(0)?;
                let rows: Vec<RowId> = master.iter().map(|v| v as RowId).collect();
                table.index_store().dispose(snapshot);
                rows
            };

            let mut snapshot = table.snapshot_indices()?;
            {
                let mut target = snapshot.get_index(list_number)?;
                for row_index in row_indices {
                    if let Ok(Value::Integer(v)) = table.get_cell(row_index, column, now, false) {
                        target.insert(v as i32);
                    }
                }
            }
            table.index_store().commit(snapshot)
        })
    }

    /// Runs `collect` against every table's oldest-reachable commit id.
    /// Intended to be invoked by the dispatcher, not user code directly.
    pub fn collect_garbage(&self) -> Result<usize> {
        let oldest = self.oldest_live_commit_id() as i64;
        let tables = self.tables.read();
        let mut total = 0;
        for table in tables.values() {
            total += table.lock().collect(oldest)?;
        }
        Ok(total)
    }
}
