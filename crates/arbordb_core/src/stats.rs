//! Transaction statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = TransactionManager::new(backend, EngineConfig::default());
//!
//! // Run transactions...
//!
//! let stats = manager.stats().snapshot();
//! println!("Committed: {}", stats.committed);
//! println!("Conflicts: {}", stats.conflicts);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction counters.
///
/// All counters are atomic and can be read while transactions are in
/// progress. Values only ever increase.
#[derive(Debug, Default)]
pub struct TransactionStats {
    started: AtomicU64,
    committed: AtomicU64,
    /// Commits of transactions that wrote nothing.
    read_only: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
    faults: AtomicU64,
    /// Change sink calls that failed.
    sink_errors: AtomicU64,
}

impl TransactionStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self, read_only: bool) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        if read_only {
            self.read_only.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the number of transactions begun.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions committed.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Returns the number of committed transactions that wrote nothing.
    pub fn read_only(&self) -> u64 {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Returns the number of aborted transactions, conflicts included.
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of commits that failed with a conflict.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns the number of commits that failed with a storage fault.
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Returns the number of failed change sink calls.
    pub fn sink_errors(&self) -> u64 {
        self.sink_errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started(),
            committed: self.committed(),
            read_only: self.read_only(),
            aborted: self.aborted(),
            conflicts: self.conflicts(),
            faults: self.faults(),
            sink_errors: self.sink_errors(),
        }
    }
}

/// A point-in-time copy of [`TransactionStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Transactions begun.
    pub started: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Committed transactions that wrote nothing.
    pub read_only: u64,
    /// Transactions aborted.
    pub aborted: u64,
    /// Commits rejected by conflict detection.
    pub conflicts: u64,
    /// Commits that failed with a storage fault.
    pub faults: u64,
    /// Failed change sink calls.
    pub sink_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = TransactionStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_transactions() {
        let stats = TransactionStats::new();

        stats.record_start();
        stats.record_start();
        stats.record_commit(true);
        stats.record_abort();
        stats.record_conflict();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.committed, 1);
        assert_eq!(snapshot.read_only, 1);
        assert_eq!(snapshot.aborted, 1);
        assert_eq!(snapshot.conflicts, 1);
        assert_eq!(snapshot.faults, 0);
    }
}
