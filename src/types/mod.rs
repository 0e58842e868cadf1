//! Scalar value and row types shared across the storage and transaction core.

mod table;

pub use table::{ColumnDef, ColumnType, ForeignKeyDef, IndexDef, IndexType, TableSchema};

use serde::{Deserialize, Serialize};

/// A decoded cell value. Inline values are encoded directly in the record
/// area; `Blob` cells carry a reference into the table's BlobStore instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Blob(BlobId),
    Null,
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

/// A row is an ordered sequence of typed cells, positional per the table schema.
pub type Row = Vec<Value>;

/// Row identifier: the FixedRecordList slot index in a table's row-slot list.
pub type RowId = u64;

/// Opaque handle into a table's BlobStore.
pub type BlobId = u64;

/// Monotonically increasing commit identifier assigned by the conglomerate.
pub type CommitId = u64;

/// Table identifier, stable for the lifetime of the table.
pub type TableId = u32;
