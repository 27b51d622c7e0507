//! Error types for shardstore

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Shard lifecycle errors ===
    #[error("shard already registered: {0}")]
    ShardExists(String),

    #[error("shard not found: {0}")]
    ShardUnknown(String),

    #[error("shard initialization failed: {0}")]
    InitializationFailed(String),

    #[error("failed to register shard: {0}")]
    RegisterFailed(Arc<Error>),

    #[error("failed to recover shard: {0}")]
    RecoverFailed(Arc<Error>),

    #[error("failed to acquire shard: {0}")]
    AcquireFailed(Arc<Error>),

    #[error("shard is in errored state: {0}")]
    ShardErrored(Arc<Error>),

    #[error("refused to recover shard in state other than errored; current state: {0}")]
    RecoveryRefused(String),

    #[error("failed to delete shard {key}: {cause}")]
    DeleteFailed { key: String, cause: Arc<Error> },

    /// A failure cause still shared with other waiters of the same shard.
    #[error("{0}")]
    Failed(Arc<Error>),

    // === Storage errors ===
    #[error("mount error: {0}")]
    Mount(String),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    // === Metadata errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Lifecycle ===
    #[error("coordinator shut down")]
    Shutdown,

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Unwrap a shared cause back into a plain error, keeping the shared
    /// handle when other references are still alive.
    pub fn from_shared(err: Arc<Error>) -> Error {
        Arc::try_unwrap(err).unwrap_or_else(Error::Failed)
    }

    /// Does this error mean the coordinator is no longer running?
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
