//! Transaction manager.

use super::state::TransactionState;
use super::txn::Transaction;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{CoreError, CoreResult};
use crate::notify::{deliver, ChangeSink};
use crate::shield::shielded;
use crate::stats::TransactionStats;
use crate::types::TxnId;
use arbordb_storage::{StorageBackend, Tid};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Binds transactions to execution contexts and finishes them safely.
///
/// The manager provides:
/// - At most one live transaction per [`ExecutionContext`]
/// - Connection acquisition at `begin` and release on every exit path
/// - Shielded commit and abort: once started they run to completion even if
///   the caller is cancelled
/// - Change notification after successful commits
///
/// Cloning is cheap; clones share bindings, statistics and the sink.
///
/// ## Example
///
/// ```rust,ignore
/// let manager = TransactionManager::new(backend, EngineConfig::default());
/// let ctx = ExecutionContext::with_principal("editor");
///
/// let txn = manager.begin(&ctx).await?;
/// txn.add(ObjectWrite::resource(Oid::new(), Oid::ROOT, "news", "Folder", state))?;
/// manager.commit(&ctx).await?;
/// ```
#[derive(Clone)]
pub struct TransactionManager {
    backend: Arc<dyn StorageBackend>,
    config: Arc<EngineConfig>,
    /// Most recently begun transaction, for callers without a context.
    last: Arc<Mutex<Option<Arc<Transaction>>>>,
    next_txn_id: Arc<AtomicU64>,
    sink: Option<Arc<dyn ChangeSink>>,
    stats: Arc<TransactionStats>,
}

impl TransactionManager {
    /// Creates a manager over `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            last: Arc::new(Mutex::new(None)),
            next_txn_id: Arc::new(AtomicU64::new(1)),
            sink: None,
            stats: Arc::new(TransactionStats::new()),
        }
    }

    /// Notifies `sink` after every successful commit.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the transaction counters.
    #[must_use]
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Begins a transaction and binds it to `ctx`.
    ///
    /// Suspends while the connection pool is exhausted.
    ///
    /// # Errors
    ///
    /// Fails if `ctx` already has an active transaction, or with
    /// [`CoreError::BackendUnavailable`] if no connection could be obtained.
    pub async fn begin(&self, ctx: &ExecutionContext) -> CoreResult<Arc<Transaction>> {
        if let Some(bound) = ctx.transaction() {
            if !bound.state().is_terminal() {
                return Err(CoreError::invalid_operation(format!(
                    "{} already has {} open",
                    ctx.id(),
                    bound.id()
                )));
            }
        }

        let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::Relaxed));
        let txn = Arc::new(Transaction::new(
            id,
            Arc::clone(&self.backend),
            ctx.principal().map(str::to_string),
            self.config.blob_chunk_size,
            ctx.handle(),
        ));

        let conn = self.backend.open().await?;
        txn.begin(conn).await?;

        ctx.bind(Arc::clone(&txn));
        *self.last.lock() = Some(Arc::clone(&txn));
        self.stats.record_start();
        debug!(txn = %id, ctx = %ctx.id(), principal = ?ctx.principal(), "bound transaction");
        Ok(txn)
    }

    /// Returns the transaction bound to `ctx`, or the most recently begun
    /// one when no context is given.
    #[must_use]
    pub fn get(&self, ctx: Option<&ExecutionContext>) -> Option<Arc<Transaction>> {
        match ctx {
            Some(ctx) => ctx.transaction(),
            None => self.last.lock().clone(),
        }
    }

    /// Commits the transaction bound to `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if nothing is bound; see
    /// [`commit_txn`](Self::commit_txn) for commit errors.
    pub async fn commit(&self, ctx: &ExecutionContext) -> CoreResult<Option<Tid>> {
        let txn = ctx.transaction().ok_or_else(|| {
            CoreError::invalid_operation(format!("no transaction bound to {}", ctx.id()))
        })?;
        self.commit_txn(&txn).await
    }

    /// Commits `txn`, shielded from cancellation.
    ///
    /// Returns the published tid, or `None` for a transaction that wrote
    /// nothing. Whatever the outcome, the connection is released and the
    /// manager keeps no reference to `txn` once this returns.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Conflict`] if a concurrent commit touched what `txn`
    ///   read or wrote; nothing of `txn` became visible
    /// - [`CoreError::StorageFault`] for unexpected backend errors, which
    ///   are also logged
    pub async fn commit_txn(&self, txn: &Arc<Transaction>) -> CoreResult<Option<Tid>> {
        let manager = self.clone();
        let txn = Arc::clone(txn);
        shielded(async move { manager.finish_commit(txn).await }).await?
    }

    async fn finish_commit(&self, txn: Arc<Transaction>) -> CoreResult<Option<Tid>> {
        let result = txn.commit().await;
        self.forget(&txn);

        match &result {
            Ok(tid) => {
                self.stats.record_commit(tid.is_none());
                if let (Some(sink), Some(changes)) = (&self.sink, txn.changes()) {
                    let failures = deliver(sink.as_ref(), &changes).await;
                    for _ in 0..failures {
                        self.stats.record_sink_error();
                    }
                }
            }
            Err(CoreError::InvalidOperation { message }) => {
                debug!(txn = %txn.id(), %message, "commit refused");
            }
            Err(e) if e.is_conflict() => {
                self.stats.record_abort();
                self.stats.record_conflict();
                debug!(txn = %txn.id(), error = %e, "commit rejected");
            }
            Err(e) => {
                self.stats.record_abort();
                self.stats.record_fault();
                error!(txn = %txn.id(), error = %e, "error committing transaction");
            }
        }
        result
    }

    /// Aborts the transaction bound to `ctx`. A no-op if nothing is bound.
    pub async fn abort(&self, ctx: &ExecutionContext) {
        if let Some(txn) = ctx.transaction() {
            self.abort_txn(&txn).await;
        }
    }

    /// Aborts `txn`, shielded from cancellation.
    ///
    /// Always safe to call; aborting a finished transaction does nothing.
    pub async fn abort_txn(&self, txn: &Arc<Transaction>) {
        let manager = self.clone();
        let txn = Arc::clone(txn);
        let outcome = shielded(async move {
            let aborted = txn.abort().await;
            if txn.state() != TransactionState::Committing {
                manager.forget(&txn);
            }
            if aborted {
                manager.stats.record_abort();
            }
        })
        .await;

        if let Err(e) = outcome {
            error!(error = %e, "abort did not complete");
        }
    }

    /// Runs `work` in a fresh transaction and commits it, retrying on
    /// conflict up to [`EngineConfig::conflict_retries`] times.
    ///
    /// `work` is aborted (and retried if it failed with a conflict) when it
    /// returns an error.
    pub async fn run<F, Fut, T>(&self, ctx: &ExecutionContext, mut work: F) -> CoreResult<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let txn = self.begin(ctx).await?;
            let outcome = match work(Arc::clone(&txn)).await {
                Ok(value) => self.commit_txn(&txn).await.map(|_| value),
                Err(e) => {
                    self.abort_txn(&txn).await;
                    Err(e)
                }
            };

            match outcome {
                Err(e) if e.is_conflict() && attempt < self.config.conflict_retries => {
                    attempt += 1;
                    debug!(txn = %txn.id(), attempt, "retrying after conflict");
                }
                other => return other,
            }
        }
    }

    /// Drops every reference the manager and the context hold to `txn`.
    fn forget(&self, txn: &Arc<Transaction>) {
        txn.detach();
        let mut last = self.last.lock();
        if last.as_ref().is_some_and(|l| Arc::ptr_eq(l, txn)) {
            *last = None;
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("has_sink", &self.sink.is_some())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
