//! Execution contexts.
//!
//! An [`ExecutionContext`] stands for one logical unit of work, typically
//! one inbound request. It is passed explicitly to the
//! [`TransactionManager`](crate::TransactionManager), which binds at most
//! one live transaction to it. Clones share the same binding.

use crate::transaction::Transaction;
use crate::types::ContextId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct ContextInner {
    id: ContextId,
    principal: Option<String>,
    txn: Mutex<Option<Arc<Transaction>>>,
}

/// A request-like scope that owns at most one transaction.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Creates an anonymous context.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a context acting on behalf of `principal`.
    #[must_use]
    pub fn with_principal(principal: impl Into<String>) -> Self {
        Self::build(Some(principal.into()))
    }

    fn build(principal: Option<String>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
                principal,
                txn: Mutex::new(None),
            }),
        }
    }

    /// Returns the context id.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Returns the authenticated principal, if any.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.inner.principal.as_deref()
    }

    /// Returns the transaction bound to this context.
    #[must_use]
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.inner.txn.lock().clone()
    }

    pub(crate) fn bind(&self, txn: Arc<Transaction>) {
        *self.inner.txn.lock() = Some(txn);
    }

    pub(crate) fn handle(&self) -> ContextHandle {
        ContextHandle(Arc::downgrade(&self.inner))
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("principal", &self.inner.principal)
            .field("bound", &self.inner.txn.lock().is_some())
            .finish()
    }
}

/// Non-owning reference from a transaction back to its context.
#[derive(Clone, Default)]
pub(crate) struct ContextHandle(Weak<ContextInner>);

impl ContextHandle {
    /// Clears the binding if it still points at `txn`.
    pub(crate) fn unbind(&self, txn: &Transaction) {
        if let Some(inner) = self.0.upgrade() {
            let mut slot = inner.txn.lock();
            if slot.as_deref().is_some_and(|bound| std::ptr::eq(bound, txn)) {
                *slot = None;
            }
        }
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(inner) => write!(f, "ContextHandle({})", inner.id),
            None => f.write_str("ContextHandle(<dropped>)"),
        }
    }
}
