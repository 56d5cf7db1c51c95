//! Error types for storage operations.

use crate::pool::ConnectionId;
use crate::types::{BlobId, Oid, Tid};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object does not exist.
    #[error("object not found: {oid}")]
    NotFound {
        /// The missing oid.
        oid: Oid,
    },

    /// The requested blob chunk does not exist.
    #[error("blob chunk not found: {blob_id}[{chunk_index}]")]
    BlobChunkNotFound {
        /// The blob.
        blob_id: BlobId,
        /// The missing chunk index.
        chunk_index: u32,
    },

    /// The persisted serial differs from the one the writer expected.
    #[error("conflict on {oid}: expected serial {expected:?}, found {actual:?}")]
    ConflictDetected {
        /// The object written.
        oid: Oid,
        /// Serial the writer observed (`None` for a new object).
        expected: Option<Tid>,
        /// Serial currently persisted (`None` if absent).
        actual: Option<Tid>,
    },

    /// No pooled connection became free in time.
    #[error("connection pool exhausted after {timeout:?}")]
    PoolExhausted {
        /// How long the caller waited.
        timeout: Duration,
    },

    /// The backend cannot be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A transactional call was made on a connection with no open transaction.
    #[error("no transaction open on connection {connection}")]
    NoTransaction {
        /// The connection used.
        connection: ConnectionId,
    },

    /// No backend is registered under this name.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// The backend configuration is not usable.
    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding the snapshot failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The stored data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The backend was opened read-only.
    #[error("storage is read-only")]
    ReadOnly,
}

impl StorageError {
    /// Returns true when retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Unavailable(_))
    }
}
