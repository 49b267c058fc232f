use std::path::PathBuf;

use crate::search::SearchScope;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

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

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    /// Search was requested for a scope that has no chunks at all.
    #[error("document '{document_id}' is not indexed for {scope} search")]
    NotIndexed {
        document_id: String,
        scope: SearchScope,
    },

    #[error("indexing document '{document_id}' produced no chunks")]
    ChunkingProducedNothing { document_id: String },

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("indexing worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("invalid worker message: {0}")]
    Protocol(String),
}
