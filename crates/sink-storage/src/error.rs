//! Storage error types

use sink_types::TypesError;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// RocksDB error
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Invalid column family
    #[error("invalid column family: {0}")]
    InvalidColumnFamily(String),

    /// Database not open
    #[error("database not open")]
    NotOpen,

    /// Database already open
    #[error("database already open")]
    AlreadyOpen,

    /// Object store backend failure
    #[error("object store error ({backend}): {message}")]
    ObjectStore {
        /// Backend name
        backend: &'static str,
        /// Backend message
        message: String,
    },

    /// Object key that cannot be mapped onto the backend
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// Uploaded object failed read-back verification
    #[error("verification failed for {key}: {reason}")]
    Verification {
        /// Object key
        key: String,
        /// What did not match
        reason: String,
    },

    /// Stored data does not decode or disagrees with its key
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Record or key codec error
    #[error(transparent)]
    Types(#[from] TypesError),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Background task failed to complete
    #[error("task failed: {0}")]
    Task(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ObjectStore { .. } | Self::Io(_) | Self::RocksDb(_) => true,
            Self::InvalidColumnFamily(_)
            | Self::NotOpen
            | Self::AlreadyOpen
            | Self::InvalidKey(_)
            | Self::Verification { .. }
            | Self::Corrupt(_)
            | Self::Types(_)
            | Self::Json(_)
            | Self::Task(_) => false,
        }
    }

    pub(crate) fn backend(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ObjectStore {
            backend,
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::backend("s3", "503 SlowDown").is_transient());
        assert!(StorageError::Io(std::io::Error::other("reset")).is_transient());
        assert!(!StorageError::InvalidKey("../x".into()).is_transient());
        assert!(!StorageError::Corrupt("bad batch".into()).is_transient());
        assert!(!StorageError::Verification {
            key: "k".into(),
            reason: "object empty".into(),
        }
        .is_transient());
    }
}
