//! Transaction state.

use crate::error::{CoreError, CoreResult};
use arbordb_storage::{ObjectKind, ObjectWrite, Tid};

/// State of a transaction.
///
/// ```text
/// NotStarted -> Active -> Committing -> Committed
///                  |           |
///                  +-----------+-------> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, no backend transaction yet.
    NotStarted,
    /// Reads and writes are accepted.
    Active,
    /// Commit in progress.
    Committing,
    /// Published.
    Committed,
    /// Discarded.
    Aborted,
}

impl TransactionState {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    pub(crate) fn ensure_active(self) -> CoreResult<()> {
        match self {
            Self::Active => Ok(()),
            other => Err(CoreError::invalid_operation(format!(
                "transaction is {other:?}, not Active"
            ))),
        }
    }
}

/// What a pending write does at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// Create or replace the object.
    Store(ObjectWrite),
    /// Delete the object.
    Delete {
        /// Kind of the deleted object.
        kind: ObjectKind,
    },
}

/// A write staged in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    /// Serial the object had when this transaction first saw it (`None` for
    /// objects created by the transaction).
    pub expected: Option<Tid>,
    /// The staged operation.
    pub op: PendingOp,
}

impl PendingWrite {
    pub(crate) fn store(expected: Option<Tid>, write: ObjectWrite) -> Self {
        Self {
            expected,
            op: PendingOp::Store(write),
        }
    }

    pub(crate) fn delete(expected: Option<Tid>, kind: ObjectKind) -> Self {
        Self {
            expected,
            op: PendingOp::Delete { kind },
        }
    }

    /// Returns true if the object is created by this transaction.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.expected.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_accepts_work() {
        assert!(TransactionState::Active.ensure_active().is_ok());
        for state in [
            TransactionState::NotStarted,
            TransactionState::Committing,
            TransactionState::Committed,
            TransactionState::Aborted,
        ] {
            assert!(state.ensure_active().is_err());
        }
    }

    #[test]
    fn terminal_states() {
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
        assert!(!TransactionState::Committing.is_terminal());
    }
}
