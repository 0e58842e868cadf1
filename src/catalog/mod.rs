//! Table catalog: name -> schema/index bookkeeping, persisted separately
//! from the per-table storage areas so schema lookups never need to touch
//! a table's own files.

mod registry;

pub use registry::TableRegistry;
