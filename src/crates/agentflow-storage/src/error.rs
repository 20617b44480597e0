//! Storage error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors from the persistence layer.
///
/// Persistence failures are non-fatal to a run by default: the runtime
/// retries within a small budget, then logs and continues in memory.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("illegal status transition for execution {id}: {from} → {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("unknown storage backend '{name}' (expected sqlite or memory)")]
    UnknownBackend { name: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("row not found".to_string()),
            other => StorageError::Database(other.to_string()),
        }
    }
}
