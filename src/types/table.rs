//! Table schema definitions: columns, indices, and constraints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Column data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
}

/// Column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    /// Position in the row, and in the record area's cell-offset table.
    pub position: usize,
    pub nullable: bool,
    /// Whether a `UniqueViolation` must be checked for this column at commit.
    pub unique: bool,
}

impl ColumnDef {
    pub fn new(name: String, col_type: ColumnType, position: usize) -> Self {
        Self {
            name,
            col_type,
            position,
            nullable: true,
            unique: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Index type. `BTree` backs an `IndexSetStore` list; other modalities are
/// out of scope for the storage core and are not modeled here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexType {
    BTree,
}

/// A declared foreign-key constraint: every non-null value in `column_name`
/// must match some committed row's `referenced_column` in `referenced_table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKeyDef {
    pub fn new(name: String, column_name: String, referenced_table: String, referenced_column: String) -> Self {
        Self { name, column_name, referenced_table, referenced_column }
    }
}

/// Index definition, one `IndexSetStore` list per index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table_name: String,
    pub column_name: String,
    pub index_type: IndexType,
    /// List number within the table's IndexSetStore; 0 is always the master
    /// row-membership index and is not user-visible.
    pub list_number: usize,
}

impl IndexDef {
    pub fn new(name: String, table_name: String, column_name: String, list_number: usize) -> Self {
        Self {
            name,
            table_name,
            column_name,
            index_type: IndexType::BTree,
            list_number,
        }
    }
}

/// Table schema: columns, indices, and an optional primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    pub primary_key_column: Option<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    #[serde(skip)]
    column_map: HashMap<String, usize>,
}

impl TableSchema {
    pub fn new(name: String, columns: Vec<ColumnDef>) -> Self {
        let mut schema = Self {
            name,
            columns,
            indexes: Vec::new(),
            primary_key_column: None,
            foreign_keys: Vec::new(),
            column_map: HashMap::new(),
        };
        schema.rebuild_column_map();
        schema
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKeyDef) {
        self.foreign_keys.push(fk);
    }

    pub fn with_primary_key(mut self, pk_column: String) -> Self {
        self.primary_key_column = Some(pk_column);
        self
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key_column.as_deref()
    }

    pub fn add_index(&mut self, index: IndexDef) {
        self.indexes.push(index);
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_column_position(&self, name: &str) -> Option<usize> {
        self.column_map.get(name).copied()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Must be called after deserializing a schema: `column_map` is not persisted.
    pub fn rebuild_column_map(&mut self) {
        self.column_map.clear();
        for col in &self.columns {
            self.column_map.insert(col.name.clone(), col.position);
        }
    }

    pub fn validate_row(&self, row: &[crate::types::Value]) -> Result<(), String> {
        if row.len() != self.columns.len() {
            return Err(format!(
                "column count mismatch: expected {}, got {}",
                self.columns.len(),
                row.len()
            ));
        }

        for (i, col) in self.columns.iter().enumerate() {
            let value = &row[i];

            if !col.nullable && matches!(value, crate::types::Value::Null) {
                return Err(format!("column '{}' cannot be null", col.name));
            }
            if matches!(value, crate::types::Value::Null) {
                continue;
            }

            // A Blob cell is an out-of-line representation of an oversized
            // value and is accepted for any declared column type.
            let type_match = matches!(value, crate::types::Value::Blob(_))
                || matches!(
                    (&col.col_type, value),
                    (ColumnType::Integer, crate::types::Value::Integer(_))
                        | (ColumnType::Float, crate::types::Value::Float(_))
                        | (ColumnType::Float, crate::types::Value::Integer(_))
                        | (ColumnType::Boolean, crate::types::Value::Bool(_))
                        | (ColumnType::Text, crate::types::Value::Text(_))
                );

            if !type_match {
                return Err(format!(
                    "type mismatch for column '{}': expected {:?}",
                    col.name, col.col_type
                ));
            }
        }

        Ok(())
    }
}
