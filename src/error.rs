//! Error types for the storage and transaction core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("data corruption: {0}")]
    CorruptStore(String),

    #[error("committing a non-current snapshot")]
    StaleSnapshot,

    #[error("write-write conflict: {0}")]
    ReadWriteConflict(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("referential constraint violated: {0}")]
    ReferentialViolation(String),

    #[error("dirty select: row read by this transaction was modified concurrently")]
    DirtySelect,

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid blob I/O: {0}")]
    InvalidBlobIO(String),

    #[error("blob page already written: {0}")]
    BlobNotWriteOnce(String),

    #[error("corrupt blob: {0}")]
    CorruptBlob(String),

    #[error("sequence out of bounds: {0}")]
    SequenceOutOfBounds(String),

    #[error("lock wait exceeded bound: {0}")]
    LockTimeout(String),

    #[error("lock conflict: {0}")]
    Lock(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
