//! Per-transaction in-memory journal of row-level operations.
//!
//! A journal is append-only for the life of one transaction: every row add
//! or remove against any table touched by the transaction is recorded here,
//! then replayed against the committed state at commit time, or discarded
//! on rollback.

use crate::types::{RowId, TableId};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    AddRow,
    RemoveRow,
    CreateTable,
    DropTable,
    AlterConstraint,
}

#[derive(Debug, Clone, Copy)]
pub struct JournalEntry {
    pub op: JournalOp,
    pub table_id: TableId,
    pub row_index: Option<RowId>,
}

/// Append-only log of one transaction's row-level operations.
///
/// All mutators take `&self` and synchronize internally: a transaction's
/// journal is touched from exactly one thread at a time in practice, but the
/// lock keeps the type `Sync` without relying on that discipline.
pub struct TransactionJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl TransactionJournal {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, op: JournalOp, table_id: TableId, row_index: Option<RowId>) {
        self.entries.lock().push(JournalEntry { op, table_id, row_index });
    }

    pub fn add_row(&self, table_id: TableId, row_index: RowId) {
        self.record(JournalOp::AddRow, table_id, Some(row_index));
    }

    pub fn remove_row(&self, table_id: TableId, row_index: RowId) {
        self.record(JournalOp::RemoveRow, table_id, Some(row_index));
    }

    pub fn create_table(&self, table_id: TableId) {
        self.record(JournalOp::CreateTable, table_id, None);
    }

    pub fn drop_table(&self, table_id: TableId) {
        self.record(JournalOp::DropTable, table_id, None);
    }

    pub fn alter_constraint(&self, table_id: TableId) {
        self.record(JournalOp::AlterConstraint, table_id, None);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn tables_created(&self) -> Vec<TableId> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.op == JournalOp::CreateTable)
            .map(|e| e.table_id)
            .collect()
    }

    pub fn tables_dropped(&self) -> Vec<TableId> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.op == JournalOp::DropTable)
            .map(|e| e.table_id)
            .collect()
    }

    pub fn tables_constraint_altered(&self) -> Vec<TableId> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.op == JournalOp::AlterConstraint)
            .map(|e| e.table_id)
            .collect()
    }

    /// Rows this journal added or removed for one table, in journal order.
    pub fn per_table_row_changes(&self, table_id: TableId) -> Vec<(JournalOp, RowId)> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.table_id == table_id && e.row_index.is_some())
            .map(|e| (e.op, e.row_index.unwrap()))
            .collect()
    }

    /// Every distinct table touched by an add/remove in this journal.
    pub fn touched_tables(&self) -> Vec<TableId> {
        let entries = self.entries.lock();
        let mut tables: Vec<TableId> = entries.iter().map(|e| e.table_id).collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }
}

impl Default for TransactionJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let journal = TransactionJournal::new();
        journal.add_row(1, 10);
        journal.add_row(1, 11);
        journal.remove_row(1, 5);
        journal.create_table(2);

        assert_eq!(journal.tables_created(), vec![2]);
        assert_eq!(
            journal.per_table_row_changes(1),
            vec![(JournalOp::AddRow, 10), (JournalOp::AddRow, 11), (JournalOp::RemoveRow, 5)]
        );
        assert_eq!(journal.touched_tables(), vec![1, 2]);
    }

    #[test]
    fn test_empty_journal() {
        let journal = TransactionJournal::new();
        assert!(journal.is_empty());
        assert!(journal.tables_created().is_empty());
    }
}
