//! Top-level handle: opens a data directory, wires the catalog to the
//! conglomerate, and exposes the operations a host process drives a
//! transaction through.

use crate::catalog::TableRegistry;
use crate::config::DBConfig;
use crate::error::{Error, Result};
use crate::gc::{Dispatcher, Task};
use crate::table::{CellCache, MasterTableDataSource};
use crate::txn::conglomerate::{Conglomerate, Transaction};
use crate::txn::{LockManager, SequenceManager};
use crate::types::{Row, RowId, TableId, TableSchema, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// An open database. Tables are lazily materialized as
/// `MasterTableDataSource`s the first time they're touched in a process,
/// then kept registered with the conglomerate for the life of the handle.
pub struct Database {
    dir: PathBuf,
    config: DBConfig,
    registry: Arc<TableRegistry>,
    conglomerate: Arc<Conglomerate>,
    locks: Arc<LockManager>,
    sequences: Arc<SequenceManager>,
    cache: Arc<CellCache>,
    dispatcher: Dispatcher,
}

impl Database {
    /// Opens (creating if absent) the database rooted at `dir` with default
    /// configuration.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with_config(dir, DBConfig::default())
    }

    /// Opens (creating if absent) the database rooted at `dir`, applying
    /// `config`'s cache sizing and durability settings.
    pub fn open_with_config<P: AsRef<Path>>(dir: P, config: DBConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let registry = Arc::new(TableRegistry::new(&dir)?);
        let cache = Arc::new(CellCache::new(config.data_cache_size, config.max_cache_entry_size));
        let conglomerate = Arc::new(Conglomerate::new(cache.clone()));
        let dispatcher = Dispatcher::spawn(&conglomerate);
        let db = Self {
            registry,
            conglomerate,
            locks: Arc::new(LockManager::new()),
            sequences: Arc::new(SequenceManager::open(&dir)?),
            cache,
            dispatcher,
            dir,
            config,
        };

        for (table_id, name) in db.ordered_table_ids() {
            let table = db.open_table(table_id, &name)?;
            db.conglomerate.register_table(table_id, table);
        }

        db.dispatcher.schedule(Task::RowCollect, Duration::from_secs(30));
        Ok(db)
    }

    /// Whether this handle should refuse writes: `dont_synch_filesystem`
    /// and `DurabilityLevel::NoSync` both disable `fsync` on flush.
    fn effective_dont_sync(&self) -> bool {
        self.config.dont_synch_filesystem || self.config.durability_level.is_no_sync()
    }

    /// Deterministic table_id assignment: the table's rank among all table
    /// names sorted lexicographically. Stable across restarts as long as no
    /// table is renamed, since names (not ids) are the registry's durable
    /// key.
    fn ordered_table_ids(&self) -> Vec<(TableId, String)> {
        let mut names = self.registry.list_tables();
        names.sort();
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (i as TableId, name))
            .collect()
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.tbl"))
    }

    fn table_id_for(&self, name: &str) -> Result<TableId> {
        self.ordered_table_ids()
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn open_table(&self, table_id: TableId, name: &str) -> Result<MasterTableDataSource> {
        let path = self.table_path(name);
        let table = if path.exists() {
            MasterTableDataSource::open(&path, self.cache.clone())?
        } else {
            let schema = self.registry.get_table(name)?;
            MasterTableDataSource::create(&path, table_id, schema, self.cache.clone())?
        };
        table.set_dont_sync(self.effective_dont_sync());
        Ok(table)
    }

    /// Creates a new table: persists its schema in the catalog, then
    /// materializes its storage file. Serialized by the connection-wide
    /// exclusive lock since it is not validatable after the fact.
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.reject_if_read_only()?;
        let _guard = self.locks.acquire_exclusive();
        let name = schema.name.clone();
        self.registry.create_table(schema)?;
        let table_id = self.table_id_for(&name)?;
        let table = self.open_table(table_id, &name)?;
        self.conglomerate.register_table(table_id, table);
        Ok(())
    }

    /// Drops a table from the catalog and deregisters it from the
    /// conglomerate. The backing file is left on disk; callers that want
    /// the bytes reclaimed should remove it themselves once no transaction
    /// can still be reading it.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.reject_if_read_only()?;
        let _guard = self.locks.acquire_exclusive();
        let table_id = self.table_id_for(name)?;
        self.registry.drop_table(name)?;
        self.conglomerate.deregister_table(table_id);
        Ok(())
    }

    pub fn table_id(&self, name: &str) -> Result<TableId> {
        self.table_id_for(name)
    }

    pub fn begin_transaction(&self, readonly: bool) -> Arc<Transaction> {
        self.conglomerate.begin_transaction(readonly)
    }

    pub fn commit(&self, tx: &Transaction) -> Result<crate::types::CommitId> {
        self.reject_if_read_only()?;
        self.conglomerate.commit(tx)
    }

    fn reject_if_read_only(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::InvalidArgument("database is open read-only".into()));
        }
        Ok(())
    }

    pub fn rollback(&self, tx: &Transaction) {
        self.conglomerate.rollback(tx)
    }

    pub fn add_row(&self, tx: &Transaction, table_id: TableId, row: Row) -> Result<RowId> {
        self.conglomerate.add_row(tx, table_id, row)
    }

    pub fn remove_row(&self, tx: &Transaction, table_id: TableId, row_index: RowId) -> Result<()> {
        self.conglomerate.remove_row(tx, table_id, row_index)
    }

    pub fn get_cell(&self, tx: &Transaction, table_id: TableId, row_index: RowId, column: usize) -> Result<Value> {
        self.conglomerate.get_cell(tx, table_id, row_index, column)
    }

    pub fn sequences(&self) -> &Arc<SequenceManager> {
        &self.sequences
    }

    pub fn collect_garbage(&self) -> Result<usize> {
        self.conglomerate.collect_garbage()
    }

    /// Queues a lazy rebuild of `table_id`'s `list_number`'th secondary
    /// index over `column`, picked up by the background dispatcher.
    pub fn schedule_index_rebuild(&self, table_id: TableId, list_number: usize, column: usize) {
        self.dispatcher.schedule(Task::RidListBuild { table_id, list_number, column }, Duration::from_millis(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDef, ColumnType};

    fn accounts_schema() -> TableSchema {
        TableSchema::new(
            "accounts".into(),
            vec![
                ColumnDef::new("id".into(), ColumnType::Integer, 0).not_null().unique(),
                ColumnDef::new("balance".into(), ColumnType::Integer, 1),
            ],
        )
    }

    #[test]
    fn test_create_table_then_insert_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.create_table(accounts_schema()).unwrap();
        let table_id = db.table_id("accounts").unwrap();

        let tx = db.begin_transaction(false);
        let row_index = db
            .add_row(&tx, table_id, vec![Value::Integer(1), Value::Integer(100)])
            .unwrap();
        db.commit(&tx).unwrap();

        let reader = db.begin_transaction(true);
        let value = db.get_cell(&reader, table_id, row_index, 1).unwrap();
        assert_eq!(value, Value::Integer(100));
    }

    #[test]
    fn test_reopen_recovers_tables() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.create_table(accounts_schema()).unwrap();
            let table_id = db.table_id("accounts").unwrap();
            let tx = db.begin_transaction(false);
            db.add_row(&tx, table_id, vec![Value::Integer(1), Value::Integer(50)]).unwrap();
            db.commit(&tx).unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        let table_id = db.table_id("accounts").unwrap();
        let reader = db.begin_transaction(true);
        assert_eq!(db.get_cell(&reader, table_id, 0, 1).unwrap(), Value::Integer(50));
    }

    #[test]
    fn test_drop_table_removes_from_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.create_table(accounts_schema()).unwrap();
        db.drop_table("accounts").unwrap();
        assert!(db.table_id("accounts").is_err());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.create_table(accounts_schema()).unwrap();
        }

        let mut config = crate::config::DBConfig::for_testing();
        config.read_only = true;
        let db = Database::open_with_config(dir.path(), config).unwrap();
        assert!(db.create_table(accounts_schema()).is_err());

        let table_id = db.table_id("accounts").unwrap();
        let tx = db.begin_transaction(false);
        db.add_row(&tx, table_id, vec![Value::Integer(1), Value::Integer(1)]).unwrap();
        assert!(db.commit(&tx).is_err());
    }
}
