use serde::{Deserialize, Serialize};

/// Low-level storage errors (RocksDB, serialization, index metadata, transport).
/// This is the error type for the `Collection` trait. Store operations can only
/// fail with infrastructure errors, never argument errors.
///
/// Serializable so a server can hand it to remote clients unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("column family not found: {0}")]
    ColumnFamilyMissing(String),

    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    #[error("duplicate message id: {0}")]
    DuplicateId(uuid::Uuid),

    #[error("index name already in use with a different key pattern: {name}")]
    IndexConflict { name: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors returned by queue operations.
///
/// `InvalidArgument` is raised before the store is touched. Store failures pass
/// through untouched inside `Storage`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("could not create index after {attempts} attempts")]
    IndexCreation { attempts: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueueError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        QueueError::InvalidArgument(msg.into())
    }
}

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type QueueResult<T> = std::result::Result<T, QueueError>;
