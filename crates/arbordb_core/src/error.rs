//! Error types for ArborDB core.

use crate::types::TxnId;
use arbordb_storage::{BlobId, Oid, StorageError};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ArborDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Optimistic concurrency violation.
    ///
    /// Retry by re-running the whole transaction from scratch.
    #[error("conflict in {}: {} object(s) changed concurrently", fmt_txn(.txn), .oids.len())]
    Conflict {
        /// The losing transaction, when known.
        txn: Option<TxnId>,
        /// Every conflicting oid, sorted.
        oids: Vec<Oid>,
    },

    /// Object not found.
    #[error("object not found: {oid}")]
    NotFound {
        /// The missing oid.
        oid: Oid,
    },

    /// Blob not found.
    #[error("blob not found: {blob_id}")]
    BlobNotFound {
        /// The missing blob.
        blob_id: BlobId,
    },

    /// Connection pool exhausted or backend unreachable.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// What failed.
        message: String,
    },

    /// Unexpected backend error while committing.
    ///
    /// The transaction has been aborted and its connection released.
    #[error("storage fault while committing {txn}: {source}")]
    StorageFault {
        /// The transaction that failed.
        txn: TxnId,
        /// The backend error.
        #[source]
        source: StorageError,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Any other storage error.
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    /// I/O error while reading a blob source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal failure (a shielded task panicked).
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

fn fmt_txn(txn: &Option<TxnId>) -> String {
    txn.map_or_else(|| "transaction".to_string(), |t| t.to_string())
}

impl CoreError {
    /// Creates a conflict error.
    pub fn conflict(txn: Option<TxnId>, mut oids: Vec<Oid>) -> Self {
        oids.sort();
        oids.dedup();
        Self::Conflict { txn, oids }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wraps a backend error raised while committing `txn`.
    ///
    /// Typed outcomes (conflicts, missing objects, unavailability) keep
    /// their own variant.
    pub(crate) fn commit_fault(txn: TxnId, err: StorageError) -> Self {
        match err {
            StorageError::ConflictDetected { oid, .. } => Self::conflict(Some(txn), vec![oid]),
            e @ (StorageError::NotFound { .. }
            | StorageError::PoolExhausted { .. }
            | StorageError::Unavailable(_)) => Self::from(e),
            source => Self::StorageFault { txn, source },
        }
    }

    /// Returns true for [`CoreError::Conflict`].
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true when re-running the operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::BackendUnavailable { .. })
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { oid } => Self::NotFound { oid },
            StorageError::BlobChunkNotFound { blob_id, .. } => Self::BlobNotFound { blob_id },
            StorageError::ConflictDetected { oid, .. } => Self::conflict(None, vec![oid]),
            e @ (StorageError::PoolExhausted { .. } | StorageError::Unavailable(_)) => {
                Self::BackendUnavailable {
                    message: e.to_string(),
                }
            }
            other => Self::Storage(other),
        }
    }
}
