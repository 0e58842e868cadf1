//! Per-table storage: row heap, blob store, row-membership/column indices,
//! and the cell cache bridge. One `MasterTableDataSource` owns one on-disk
//! [`Store`] file and everything addressed through it.
//!
//! Row-slot format is widened from the literal 12 bytes (`status`,
//! `record_area_ptr`) to 28 bytes by adding `removed_commit_id` and
//! `added_commit_id` fields: `collect()` needs to know which commit removed
//! a row to decide whether it is older than every open transaction's base,
//! and a transaction-aware `get_cell` needs to know which commit *added* a
//! row to decide whether that commit happened at or before the caller's own
//! base commit id. Neither fits in the 12-byte layout. Documented as a
//! deliberate deviation rather than a silent one.

use crate::error::{Error, Result};
use crate::storage::{AreaId, BlobStore, FixedRecordList, IndexSet, IndexSetStore, Store};
use crate::table::cache::{CellCache, CellKey};
use crate::types::{Row, RowId, TableId, TableSchema, Value};
use std::path::Path;
use std::sync::Arc;

const ROW_SLOT_SIZE: u32 = 4 + 8 + 8 + 8; // status, record_area_ptr, removed_commit_id, added_commit_id

const UNCOMMITTED_ADDED: i32 = 0x0001;
const UNCOMMITTED_REMOVED: i32 = 0x0002;
const COMMITTED_ADDED: i32 = 0x0004;
const COMMITTED_REMOVED: i32 = 0x0008;
const ROW_STATE_MASK: i32 = 0x000F;
const SLOT_DELETED: i32 = 0x0002_0000;

const CELL_INLINE: i32 = 1;
const CELL_BLOB: i32 = 2;

const HEADER_LEN: u32 = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 8;

/// One row's current slot state and record pointer.
#[derive(Debug, Clone, Copy)]
struct RowSlot {
    status: i32,
    record_area_ptr: AreaId,
    removed_commit_id: i64,
    added_commit_id: i64,
}

impl RowSlot {
    fn decode(bytes: &[u8]) -> Self {
        RowSlot {
            status: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            record_area_ptr: i64::from_le_bytes(bytes[4..12].try_into().unwrap()) as u64,
            removed_commit_id: i64::from_le_bytes(bytes[12..20].try_into().unwrap()),
            added_commit_id: i64::from_le_bytes(bytes[20..28].try_into().unwrap()),
        }
    }

    fn encode(&self) -> [u8; ROW_SLOT_SIZE as usize] {
        let mut out = [0u8; ROW_SLOT_SIZE as usize];
        out[0..4].copy_from_slice(&self.status.to_le_bytes());
        out[4..12].copy_from_slice(&(self.record_area_ptr as i64).to_le_bytes());
        out[12..20].copy_from_slice(&self.removed_commit_id.to_le_bytes());
        out[20..28].copy_from_slice(&self.added_commit_id.to_le_bytes());
        out
    }

    fn is_slot_deleted(&self) -> bool {
        self.status & SLOT_DELETED != 0
    }

    fn row_state(&self) -> i32 {
        self.status & ROW_STATE_MASK
    }

    /// Whether a reader with `base_commit_id` may see this row, per the
    /// visibility rule: a COMMITTED_ADDED row is visible once its adding
    /// commit is at or before the reader's base; a COMMITTED_REMOVED row
    /// stays visible until its removing commit passes the reader's base.
    /// `own_write` bypasses commit-id comparison entirely: a transaction
    /// always sees its own uncommitted writes, and never anyone else's.
    fn visible_to(&self, base_commit_id: i64, own_write: bool) -> bool {
        if own_write {
            return matches!(self.row_state(), UNCOMMITTED_ADDED | COMMITTED_ADDED);
        }
        match self.row_state() {
            COMMITTED_ADDED => self.added_commit_id <= base_commit_id,
            COMMITTED_REMOVED => self.added_commit_id <= base_commit_id && self.removed_commit_id > base_commit_id,
            _ => false,
        }
    }
}

/// Per-table storage bridged to the conglomerate: row heap, blob store, and
/// secondary indices. List 0 of the table's `IndexSetStore` is always the
/// master row-membership index; lists 1.. are one per user index, in
/// `IndexDef.list_number` order.
pub struct MasterTableDataSource {
    store: Arc<Store>,
    header_id: AreaId,
    table_id: TableId,
    schema: TableSchema,
    row_slots: FixedRecordList,
    blob_store: BlobStore,
    index_store: IndexSetStore,
    cache: Arc<CellCache>,
    next_row_index: u64,
}

impl MasterTableDataSource {
    pub fn create<P: AsRef<Path>>(
        path: P,
        table_id: TableId,
        schema: TableSchema,
        cache: Arc<CellCache>,
    ) -> Result<Self> {
        let store = Arc::new(Store::open(path)?);

        let table_def_id = Self::write_schema_area(&store, &schema)?;
        let row_slot_root = FixedRecordList::create(&store, ROW_SLOT_SIZE, 64)?;
        let blob_header = BlobStore::create(&store)?;
        let index_root = IndexSetStore::create(&store)?;

        let mut w = store.create_area(HEADER_LEN);
        w.put_i32(1)?; // version
        w.put_i32(table_id as i32)?;
        w.put_i64(0)?; // sequence_id, unused at this layer
        w.put_i64(table_def_id as i64)?;
        w.put_i64(blob_header as i64)?;
        w.put_i64(index_root as i64)?;
        w.put_i64(row_slot_root as i64)?;
        w.put_i64(0)?; // next_row_index
        let header_id = w.finish()?;
        let mut reserved_buf = [0u8; 64];
        reserved_buf[0..8].copy_from_slice(&(header_id as i64).to_le_bytes());
        store.write_reserved(reserved_buf);
        store.flush()?;

        let row_slots = FixedRecordList::init(store.clone(), row_slot_root, ROW_SLOT_SIZE)?;
        let blob_store = BlobStore::init(store.clone(), blob_header)?;
        let mut index_store = IndexSetStore::init(store.clone(), index_root, 256)?;
        index_store.add_lists(1 + schema.indexes.len())?;

        Ok(Self {
            store,
            header_id,
            table_id,
            schema,
            row_slots,
            blob_store,
            index_store,
            cache,
            next_row_index: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, cache: Arc<CellCache>) -> Result<Self> {
        let store = Arc::new(Store::open(path)?);
        let reserved = store.read_reserved();
        let header_id = i64::from_le_bytes(reserved[0..8].try_into().unwrap()) as u64;

        let reader = store.get_area(header_id)?;
        let version = reader.read_i32(0);
        if version != 1 {
            return Err(Error::CorruptStore(format!("table header {header_id}: bad version")));
        }
        let table_id = reader.read_i32(4) as TableId;
        let table_def_id = reader.read_i64(16) as u64;
        let blob_header = reader.read_i64(24) as u64;
        let index_root = reader.read_i64(32) as u64;
        let row_slot_root = reader.read_i64(40) as u64;
        let next_row_index = reader.read_i64(48) as u64;

        let schema = Self::read_schema_area(&store, table_def_id)?;
        let row_slots = FixedRecordList::init(store.clone(), row_slot_root, ROW_SLOT_SIZE)?;
        let blob_store = BlobStore::init(store.clone(), blob_header)?;
        let index_store = IndexSetStore::init(store.clone(), index_root, 256)?;
        let dirty_open = !store.last_close_clean();

        let mut table = Self {
            store,
            header_id,
            table_id,
            schema,
            row_slots,
            blob_store,
            index_store,
            cache,
            next_row_index,
        };
        if dirty_open {
            table.opening_scan()?;
        }
        Ok(table)
    }

    fn persist_next_row_index(&self) -> Result<()> {
        let mut m = self.store.get_mutable_area(self.header_id)?;
        m.lock_for_write();
        m.payload_mut()[48..56].copy_from_slice(&(self.next_row_index as i64).to_le_bytes());
        m.check_out()
    }

    fn write_schema_area(store: &Store, schema: &TableSchema) -> Result<AreaId> {
        let encoded = bincode::serialize(schema)?;
        let mut w = store.create_area(encoded.len() as u32);
        w.put_bytes(&encoded)?;
        let id = w.finish()?;
        store.flush()?;
        Ok(id)
    }

    fn read_schema_area(store: &Store, area_id: AreaId) -> Result<TableSchema> {
        let reader = store.get_area(area_id)?;
        let mut schema: TableSchema = bincode::deserialize(reader.as_bytes())?;
        schema.rebuild_column_map();
        Ok(schema)
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn read_row_slot(&mut self, row_index: RowId) -> Result<RowSlot> {
        Ok(RowSlot::decode(&self.row_slots.read_slot(row_index)?))
    }

    fn write_row_slot(&mut self, row_index: RowId, slot: RowSlot) -> Result<()> {
        self.row_slots.write_slot(row_index, &slot.encode())
    }

    fn encode_record(&mut self, row: &Row) -> Result<Vec<u8>> {
        if row.len() != self.schema.columns.len() {
            return Err(Error::InvalidArgument(format!(
                "row has {} cells, table has {} columns",
                row.len(),
                self.schema.columns.len()
            )));
        }

        let mut cell_headers = Vec::with_capacity(row.len());
        let mut payload = Vec::new();

        for value in row {
            let offset = payload.len() as i32;
            match value {
                Value::Blob(blob_id) => {
                    self.blob_store.establish_reference(*blob_id)?;
                    cell_headers.push((CELL_BLOB, offset));
                    let blob_ref = self.blob_store.get(*blob_id)?;
                    payload.extend_from_slice(&(blob_ref.kind as i32).to_le_bytes());
                    payload.extend_from_slice(&0i32.to_le_bytes());
                    payload.extend_from_slice(&(*blob_id as i64).to_le_bytes());
                }
                other => {
                    cell_headers.push((CELL_INLINE, offset));
                    let encoded = bincode::serialize(other)?;
                    payload.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                    payload.extend_from_slice(&encoded);
                }
            }
        }

        let mut record = Vec::new();
        record.extend_from_slice(&0i32.to_le_bytes()); // reserved
        for (cell_type, offset) in &cell_headers {
            record.extend_from_slice(&cell_type.to_le_bytes());
            record.extend_from_slice(&offset.to_le_bytes());
        }
        record.extend_from_slice(&payload);
        Ok(record)
    }

    fn decode_cell(&mut self, record_area: AreaId, column: usize) -> Result<Value> {
        let reader = self.store.get_area(record_area)?;
        let bytes = reader.as_bytes();
        let column_count = self.schema.columns.len();
        let header_off = 4 + column * 8;
        let cell_type = i32::from_le_bytes(bytes[header_off..header_off + 4].try_into().unwrap());
        let offset = i32::from_le_bytes(bytes[header_off + 4..header_off + 8].try_into().unwrap()) as usize;
        let payload_start = 4 + column_count * 8;

        match cell_type {
            CELL_INLINE => {
                let at = payload_start + offset;
                let len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
                let value: Value = bincode::deserialize(&bytes[at + 4..at + 4 + len])?;
                Ok(value)
            }
            CELL_BLOB => {
                let at = payload_start + offset;
                let blob_id = i64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap()) as u64;
                Ok(Value::Blob(blob_id))
            }
            other => Err(Error::CorruptStore(format!("unknown cell_type {other} in record {record_area}"))),
        }
    }

    /// Writes the record area, claims a row slot, and records the add in
    /// `journal`. Blob cells must already be allocated, written, and
    /// completed via this table's [`BlobStore`] before calling.
    pub fn add_row(&mut self, row: &Row, journal: &crate::table::journal::TransactionJournal) -> Result<RowId> {
        self.schema.validate_row(row).map_err(Error::InvalidArgument)?;
        let record = self.encode_record(row)?;

        let mut w = self.store.create_area(record.len() as u32);
        w.put_bytes(&record)?;
        let record_area_ptr = w.finish()?;

        let row_index = self.claim_row_slot()?;
        self.write_row_slot(
            row_index,
            RowSlot { status: UNCOMMITTED_ADDED, record_area_ptr, removed_commit_id: -1, added_commit_id: -1 },
        )?;
        self.store.flush()?;

        journal.add_row(self.table_id, row_index);
        Ok(row_index)
    }

    fn claim_row_slot(&mut self) -> Result<RowId> {
        let head = self.row_slots.reserved_long();
        if head != -1 {
            let slot_index = head as u64;
            let slot = self.read_row_slot(slot_index)?;
            self.row_slots.set_reserved_long(slot.record_area_ptr as i64)?;
            return Ok(slot_index);
        }
        let index = self.next_row_index;
        self.next_row_index += 1;
        self.persist_next_row_index()?;
        Ok(index)
    }

    /// Transitions UNCOMMITTED_ADDED -> fully reclaimed (never durable) or
    /// COMMITTED_ADDED -> UNCOMMITTED_REMOVED.
    pub fn remove_row(&mut self, row_index: RowId, journal: &crate::table::journal::TransactionJournal) -> Result<()> {
        let slot = self.read_row_slot(row_index)?;
        if slot.is_slot_deleted() {
            return Err(Error::InvalidReference(format!("row {row_index} already deleted")));
        }

        match slot.row_state() {
            UNCOMMITTED_ADDED => {
                self.free_row_slot(row_index, slot)?;
            }
            COMMITTED_ADDED => {
                self.write_row_slot(
                    row_index,
                    RowSlot { status: UNCOMMITTED_REMOVED, ..slot },
                )?;
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "row {row_index} is not removable from state {other:#x}"
                )));
            }
        }

        for c in 0..self.schema.columns.len() {
            self.cache.invalidate(CellKey { table_id: self.table_id, row_index, column: c as u16 });
        }
        journal.remove_row(self.table_id, row_index);
        self.store.flush()?;
        Ok(())
    }

    /// Undoes an uncommitted add from a rolled-back transaction: frees the
    /// row slot exactly as if it had been removed before ever going durable.
    pub fn undo_add(&mut self, row_index: RowId) -> Result<()> {
        let slot = self.read_row_slot(row_index)?;
        if slot.row_state() == UNCOMMITTED_ADDED {
            self.free_row_slot(row_index, slot)?;
            self.store.flush()?;
        }
        Ok(())
    }

    /// Undoes an uncommitted remove from a rolled-back transaction: restores
    /// the row to COMMITTED_ADDED so it stays visible to everyone else.
    pub fn undo_remove(&mut self, row_index: RowId) -> Result<()> {
        let slot = self.read_row_slot(row_index)?;
        if slot.row_state() == UNCOMMITTED_REMOVED {
            self.write_row_slot(row_index, RowSlot { status: COMMITTED_ADDED, ..slot })?;
            self.store.flush()?;
        }
        Ok(())
    }

    pub fn update_row(
        &mut self,
        old: RowId,
        new: &Row,
        journal: &crate::table::journal::TransactionJournal,
    ) -> Result<RowId> {
        self.remove_row(old, journal)?;
        self.add_row(new, journal)
    }

    /// Transaction-visibility-aware cell read: a row is only returned if
    /// `base_commit_id`/`own_write` place it within the caller's snapshot.
    /// `own_write` is true when the calling transaction itself is the one
    /// that added or removed this row (uncommitted or not); otherwise the
    /// row must already be durably committed at or before `base_commit_id`.
    /// The cache is only consulted once visibility is established, since it
    /// stores no transaction context of its own.
    pub fn get_cell(&mut self, row_index: RowId, column: usize, base_commit_id: i64, own_write: bool) -> Result<Value> {
        let slot = self.read_row_slot(row_index)?;
        if slot.is_slot_deleted() {
            return Err(Error::InvalidReference(format!("row {row_index} does not exist")));
        }
        if !slot.visible_to(base_commit_id, own_write) {
            return Err(Error::InvalidReference(format!("row {row_index} does not exist")));
        }

        let key = CellKey { table_id: self.table_id, row_index, column: column as u16 };
        if let Some(cached) = self.cache.get(key) {
            return Ok((*cached).clone());
        }
        let value = self.decode_cell(slot.record_area_ptr, column)?;
        self.cache.put(key, value.clone());
        Ok(value)
    }

    /// Every COMMITTED_ADDED row's value for `column`, for committed-state
    /// uniqueness scans during commit validation. Bypasses the cell cache;
    /// intended for full-table scans under the table's own lock, not for
    /// routine per-row reads.
    pub fn scan_committed_column(&mut self, column: usize) -> Result<Vec<(RowId, Value)>> {
        let count = self.next_row_index;
        let mut out = Vec::new();
        for row_index in 0..count {
            let slot = self.read_row_slot(row_index)?;
            if slot.is_slot_deleted() || slot.row_state() != COMMITTED_ADDED {
                continue;
            }
            out.push((row_index, self.decode_cell(slot.record_area_ptr, column)?));
        }
        Ok(out)
    }

    fn free_row_slot(&mut self, row_index: RowId, slot: RowSlot) -> Result<()> {
        let record_area = slot.record_area_ptr;
        for c in 0..self.schema.columns.len() {
            if let Ok(Value::Blob(blob_id)) = self.decode_cell(record_area, c) {
                self.blob_store.release_reference(blob_id)?;
            }
        }
        self.store.delete_area(record_area);

        let old_head = self.row_slots.reserved_long();
        self.write_row_slot(
            row_index,
            RowSlot {
                status: SLOT_DELETED,
                record_area_ptr: old_head.max(-1) as u64,
                removed_commit_id: -1,
                added_commit_id: -1,
            },
        )?;
        self.row_slots.set_reserved_long(row_index as i64)?;
        self.store.flush()
    }

    /// On a dirty open, any UNCOMMITTED_* row was never durably published:
    /// rewrite it to deleted and reclaim its record area.
    pub fn opening_scan(&mut self) -> Result<()> {
        let count = self.next_row_index;
        for row_index in 0..count {
            let slot = self.read_row_slot(row_index)?;
            if slot.is_slot_deleted() {
                continue;
            }
            match slot.row_state() {
                UNCOMMITTED_ADDED => self.free_row_slot(row_index, slot)?,
                UNCOMMITTED_REMOVED => {
                    self.write_row_slot(row_index, RowSlot { status: COMMITTED_ADDED, ..slot })?;
                }
                _ => {}
            }
        }
        self.store.flush()
    }

    /// Reclaims slots whose row was COMMITTED_REMOVED strictly before
    /// `oldest_live_commit_id`: frees the record area and any blob
    /// references it held, then pushes the slot onto the free chain.
    pub fn collect(&mut self, oldest_live_commit_id: i64) -> Result<usize> {
        let count = self.next_row_index;
        let mut collected = 0;
        for row_index in 0..count {
            let slot = self.read_row_slot(row_index)?;
            if slot.is_slot_deleted() {
                continue;
            }
            if slot.row_state() == COMMITTED_REMOVED && slot.removed_commit_id < oldest_live_commit_id {
                self.free_row_slot(row_index, slot)?;
                collected += 1;
            }
        }
        if collected > 0 {
            self.store.flush()?;
        }
        Ok(collected)
    }

    /// Flips a row's durable state once its owning transaction's commit is
    /// published: stamps `added_commit_id` on rows the transaction added, so
    /// a later transaction-visibility check can tell whether the add
    /// happened at or before its own base commit id, and stamps
    /// `removed_commit_id` on rows it removed so `collect` can later tell
    /// when they are safe to reclaim.
    pub fn apply_commit(&mut self, row_index: RowId, added: bool, commit_id: i64) -> Result<()> {
        let slot = self.read_row_slot(row_index)?;
        if added {
            self.write_row_slot(row_index, RowSlot { status: COMMITTED_ADDED, added_commit_id: commit_id, ..slot })
        } else {
            self.write_row_slot(
                row_index,
                RowSlot { status: COMMITTED_REMOVED, removed_commit_id: commit_id, ..slot },
            )
        }
    }

    pub fn row_count_hint(&self) -> u64 {
        self.next_row_index
    }

    /// Elides `fsync` after commit flushes on this table's underlying
    /// `Store`, per `DBConfig::dont_synch_filesystem` / `DurabilityLevel::NoSync`.
    pub fn set_dont_sync(&self, dont_sync: bool) {
        self.store.set_dont_sync(dont_sync);
    }

    pub fn index_store(&mut self) -> &mut IndexSetStore {
        &mut self.index_store
    }

    pub fn blob_store(&mut self) -> &mut BlobStore {
        &mut self.blob_store
    }

    pub fn snapshot_indices(&mut self) -> Result<IndexSet> {
        self.index_store.snapshot()
    }

    pub fn header_id(&self) -> AreaId {
        self.header_id
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::journal::TransactionJournal;
    use crate::types::{ColumnDef, ColumnType};
    use tempfile::tempdir;

    fn schema() -> TableSchema {
        TableSchema::new(
            "t".into(),
            vec![
                ColumnDef::new("id".into(), ColumnType::Integer, 0).not_null(),
                ColumnDef::new("name".into(), ColumnType::Text, 1),
            ],
        )
    }

    fn new_cache() -> Arc<CellCache> {
        Arc::new(CellCache::new(1 << 20, 1 << 16))
    }

    #[test]
    fn test_add_and_get_cell() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let row_index = table
            .add_row(&vec![Value::Integer(1), Value::Text("a".into())], &journal)
            .unwrap();

        assert_eq!(table.get_cell(row_index, 0, 0, true).unwrap(), Value::Integer(1));
        assert_eq!(table.get_cell(row_index, 1, 0, true).unwrap(), Value::Text("a".into()));
        assert_eq!(journal.per_table_row_changes(1).len(), 1);
    }

    #[test]
    fn test_remove_uncommitted_added_frees_immediately() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let row_index = table
            .add_row(&vec![Value::Integer(1), Value::Text("a".into())], &journal)
            .unwrap();
        table.remove_row(row_index, &journal).unwrap();

        let err = table.get_cell(row_index, 0, 0, true).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }

    #[test]
    fn test_get_cell_hides_uncommitted_add_from_other_transactions() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let row_index = table
            .add_row(&vec![Value::Integer(1), Value::Text("a".into())], &journal)
            .unwrap();

        // Uncommitted: own writer sees it, nobody else does regardless of base.
        assert!(table.get_cell(row_index, 0, 0, true).is_ok());
        let err = table.get_cell(row_index, 0, i64::MAX, false).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));

        table.apply_commit(row_index, true, 5).unwrap();
        // Committed at 5: visible to a base >= 5, not to an earlier base.
        assert!(table.get_cell(row_index, 0, 4, false).is_err());
        assert!(table.get_cell(row_index, 0, 5, false).is_ok());
    }

    #[test]
    fn test_get_cell_hides_row_removed_before_reader_base() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let row_index = table.add_row(&vec![Value::Integer(1), Value::Null], &journal).unwrap();
        table.apply_commit(row_index, true, 1).unwrap();
        table.remove_row(row_index, &journal).unwrap();
        table.apply_commit(row_index, false, 5).unwrap();

        // A reader whose snapshot predates the removal still sees the row.
        assert!(table.get_cell(row_index, 0, 3, false).is_ok());
        // A reader whose snapshot is at or after the removal does not.
        assert!(table.get_cell(row_index, 0, 5, false).is_err());
    }

    #[test]
    fn test_update_row_reuses_freed_slot() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let r0 = table.add_row(&vec![Value::Integer(1), Value::Null], &journal).unwrap();
        table.apply_commit(r0, true, 1).unwrap();
        let r1 = table
            .update_row(r0, &vec![Value::Integer(2), Value::Null], &journal)
            .unwrap();

        assert_eq!(r1, r0, "freed row slot should be reused immediately");
        assert_eq!(table.get_cell(r1, 0, 0, true).unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_rollback_undo_restores_and_frees_slots() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let committed = table.add_row(&vec![Value::Integer(1), Value::Null], &journal).unwrap();
        table.apply_commit(committed, true, 1).unwrap();

        // Simulate an aborted transaction: one row removed, one row added,
        // neither ever reaches apply_commit.
        table.remove_row(committed, &journal).unwrap();
        let uncommitted = table.add_row(&vec![Value::Integer(2), Value::Null], &journal).unwrap();

        table.undo_remove(committed).unwrap();
        table.undo_add(uncommitted).unwrap();

        assert_eq!(table.get_cell(committed, 0, 100, false).unwrap(), Value::Integer(1));
        assert!(table.get_cell(uncommitted, 0, 100, false).is_err());
    }

    #[test]
    fn test_opening_scan_discards_uncommitted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.store");
        let cache = new_cache();

        {
            let mut table = MasterTableDataSource::create(&path, 1, schema(), cache.clone()).unwrap();
            let journal = TransactionJournal::new();
            let r0 = table.add_row(&vec![Value::Integer(1), Value::Null], &journal).unwrap();
            table.apply_commit(r0, true, 1).unwrap();

            // An uncommitted add that never reached apply_commit.
            table.add_row(&vec![Value::Integer(2), Value::Null], &journal).unwrap();
            table.flush().unwrap();
        }

        let mut reopened = MasterTableDataSource::open(&path, cache).unwrap();
        let r0_cell = reopened.get_cell(0, 0, 1, false).unwrap();
        assert_eq!(r0_cell, Value::Integer(1));

        let err = reopened.get_cell(1, 0, i64::MAX, false).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)), "uncommitted add should have been discarded");
    }

    #[test]
    fn test_collect_reclaims_old_committed_removed() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let r0 = table.add_row(&vec![Value::Integer(1), Value::Null], &journal).unwrap();
        table.apply_commit(r0, true, 1).unwrap();
        table.remove_row(r0, &journal).unwrap();
        table.apply_commit(r0, false, 5).unwrap();

        let collected = table.collect(3).unwrap();
        assert_eq!(collected, 0, "not yet older than every open transaction's base");

        let collected = table.collect(10).unwrap();
        assert_eq!(collected, 1);
    }

    #[test]
    fn test_blob_cell_round_trip() {
        let dir = tempdir().unwrap();
        let mut table = MasterTableDataSource::create(dir.path().join("t.store"), 1, schema(), new_cache()).unwrap();
        let journal = TransactionJournal::new();

        let data = vec![9u8; 10];
        let blob_ref = table
            .blob_store()
            .allocate(crate::storage::blob_store::KIND_BINARY, false, data.len() as u64)
            .unwrap();
        table.blob_store().write(&blob_ref, 0, &data).unwrap();
        table.blob_store().complete(&blob_ref).unwrap();

        let row_index = table
            .add_row(&vec![Value::Blob(blob_ref.id), Value::Null], &journal)
            .unwrap();

        assert_eq!(table.get_cell(row_index, 0, 0, true).unwrap(), Value::Blob(blob_ref.id));
    }
}
