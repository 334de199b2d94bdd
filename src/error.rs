use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("cannot map {class} to an index document: {reason}")]
    Mapping { class: String, reason: String },

    #[error("{class} has no identifier yet")]
    Transient { class: String },

    #[error("index store unavailable at {location}: {reason}")]
    StoreUnavailable { location: String, reason: String },

    #[error("index write failed: {0}")]
    Write(String),

    #[error("index read failed: {0}")]
    Read(String),

    #[error("invalid query: {0}")]
    Query(String),

    #[error("search thread terminated abnormally")]
    SearchAborted,

    #[error("index manager failed to {operation}: {source}")]
    IndexManager {
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn write(err: impl std::fmt::Display) -> Self {
        Self::Write(err.to_string())
    }

    pub(crate) fn read(err: impl std::fmt::Display) -> Self {
        Self::Read(err.to_string())
    }

    pub(crate) fn manager(operation: &'static str, source: Error) -> Self {
        Self::IndexManager {
            operation,
            source: Box::new(source),
        }
    }
}
