//! Table registry: durable name -> `TableSchema` mapping for the catalog.

use crate::error::{Error, Result};
use crate::types::{IndexDef, TableSchema};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry metadata, persisted whole on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryMetadata {
    tables: HashMap<String, TableSchema>,
    /// Index name -> (table_name, column_name), for name-based lookup
    /// without scanning every table's index list.
    index_map: HashMap<String, (String, String)>,
}

/// Durable table registry. Schemas are kept in memory and flushed to a
/// single `catalog.bin` file after every mutation; table data itself lives
/// in the per-table storage areas this registry only points at by name.
pub struct TableRegistry {
    metadata: Arc<RwLock<RegistryMetadata>>,
    persist_path: PathBuf,
}

impl TableRegistry {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let persist_path = data_dir.as_ref().join("catalog.bin");

        if let Some(parent) = persist_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let metadata = if persist_path.exists() {
            let data = fs::read(&persist_path)?;
            let mut meta: RegistryMetadata = bincode::deserialize(&data)?;
            for schema in meta.tables.values_mut() {
                schema.rebuild_column_map();
            }
            meta
        } else {
            RegistryMetadata {
                tables: HashMap::new(),
                index_map: HashMap::new(),
            }
        };

        Ok(Self {
            metadata: Arc::new(RwLock::new(metadata)),
            persist_path,
        })
    }

    pub fn create_table(&self, mut schema: TableSchema) -> Result<()> {
        let mut meta = self.metadata.write();

        if meta.tables.contains_key(&schema.name) {
            return Err(Error::TableExists(schema.name));
        }

        for index in &schema.indexes {
            if meta.index_map.contains_key(&index.name) {
                return Err(Error::InvalidArgument(format!(
                    "index '{}' already exists",
                    index.name
                )));
            }
        }

        schema.rebuild_column_map();

        for index in &schema.indexes {
            meta.index_map.insert(
                index.name.clone(),
                (index.table_name.clone(), index.column_name.clone()),
            );
        }

        meta.tables.insert(schema.name.clone(), schema);
        drop(meta);
        self.persist()
    }

    pub fn drop_table(&self, table_name: &str) -> Result<()> {
        let mut meta = self.metadata.write();

        let schema = meta
            .tables
            .remove(table_name)
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;

        for index in &schema.indexes {
            meta.index_map.remove(&index.name);
        }

        drop(meta);
        self.persist()
    }

    pub fn get_table(&self, table_name: &str) -> Result<TableSchema> {
        self.metadata
            .read()
            .tables
            .get(table_name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.metadata.read().tables.keys().cloned().collect()
    }

    pub fn table_exists(&self, table_name: &str) -> bool {
        self.metadata.read().tables.contains_key(table_name)
    }

    pub fn add_index(&self, index: IndexDef) -> Result<()> {
        let mut meta = self.metadata.write();

        if meta.index_map.contains_key(&index.name) {
            return Err(Error::InvalidArgument(format!(
                "index '{}' already exists",
                index.name
            )));
        }

        if !meta.tables.contains_key(&index.table_name) {
            return Err(Error::TableNotFound(index.table_name));
        }

        if let Some(table) = meta.tables.get(&index.table_name) {
            if table.get_column(&index.column_name).is_none() {
                return Err(Error::ColumnNotFound(format!(
                    "{}.{}",
                    index.table_name, index.column_name
                )));
            }
        }

        meta.index_map.insert(
            index.name.clone(),
            (index.table_name.clone(), index.column_name.clone()),
        );

        if let Some(table) = meta.tables.get_mut(&index.table_name) {
            table.add_index(index);
        }

        drop(meta);
        self.persist()
    }

    pub fn get_index(&self, index_name: &str) -> Result<IndexDef> {
        let meta = self.metadata.read();

        let (table_name, _column_name) = meta
            .index_map
            .get(index_name)
            .ok_or_else(|| Error::InvalidArgument(format!("index '{index_name}' not found")))?;

        let table = meta
            .tables
            .get(table_name)
            .ok_or_else(|| Error::TableNotFound(table_name.clone()))?;

        table
            .indexes
            .iter()
            .find(|idx| idx.name == index_name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("index '{index_name}' not found")))
    }

    fn persist(&self) -> Result<()> {
        let meta = self.metadata.read();
        let data = bincode::serialize(&*meta)?;
        fs::write(&self.persist_path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDef, ColumnType};

    #[test]
    fn test_create_and_get_table() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(temp_dir.path()).unwrap();

        let schema = TableSchema::new(
            "users".into(),
            vec![
                ColumnDef::new("id".into(), ColumnType::Integer, 0),
                ColumnDef::new("name".into(), ColumnType::Text, 1),
            ],
        );

        registry.create_table(schema.clone()).unwrap();

        let retrieved = registry.get_table("users").unwrap();
        assert_eq!(retrieved.name, "users");
        assert_eq!(retrieved.column_count(), 2);
    }

    #[test]
    fn test_drop_table() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(temp_dir.path()).unwrap();

        let schema = TableSchema::new("test".into(), vec![]);
        registry.create_table(schema).unwrap();

        assert!(registry.table_exists("test"));

        registry.drop_table("test").unwrap();
        assert!(!registry.table_exists("test"));
    }

    #[test]
    fn test_list_tables() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(temp_dir.path()).unwrap();

        registry.create_table(TableSchema::new("t1".into(), vec![])).unwrap();
        registry.create_table(TableSchema::new("t2".into(), vec![])).unwrap();

        let tables = registry.list_tables();
        assert_eq!(tables.len(), 2);
        assert!(tables.contains(&"t1".to_string()));
        assert!(tables.contains(&"t2".to_string()));
    }

    #[test]
    fn test_add_index() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registry = TableRegistry::new(temp_dir.path()).unwrap();

        let schema = TableSchema::new(
            "articles".into(),
            vec![
                ColumnDef::new("id".into(), ColumnType::Integer, 0),
                ColumnDef::new("title".into(), ColumnType::Text, 1),
            ],
        );

        registry.create_table(schema.clone()).unwrap();

        let index = IndexDef::new(
            "articles_title_idx".into(),
            "articles".into(),
            "title".into(),
            1,
        );

        registry.add_index(index).unwrap();

        let retrieved_index = registry.get_index("articles_title_idx").unwrap();
        assert_eq!(retrieved_index.column_name, "title");
    }

    #[test]
    fn test_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();

        {
            let registry = TableRegistry::new(temp_dir.path()).unwrap();
            let schema = TableSchema::new(
                "persistent".into(),
                vec![ColumnDef::new("id".into(), ColumnType::Integer, 0)],
            );
            registry.create_table(schema).unwrap();
        }

        {
            let registry = TableRegistry::new(temp_dir.path()).unwrap();
            assert!(registry.table_exists("persistent"));
            let schema = registry.get_table("persistent").unwrap();
            assert_eq!(schema.column_count(), 1);
        }
    }
}
