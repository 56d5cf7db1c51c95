//! Change notification for external indexers.
//!
//! After a transaction commits, the manager hands what it changed to a
//! [`ChangeSink`]. Notification happens outside the transaction: a failing
//! sink is logged and never rolls anything back.

use arbordb_storage::{ObjectWrite, Oid, Tid};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Fields handed to the indexer for one object.
pub type IndexFields = Map<String, Value>;

/// Error returned by a [`ChangeSink`].
#[derive(Debug, Error)]
#[error("change sink failed: {0}")]
pub struct SinkError(pub String);

/// Resources changed by one committed transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Tid the changes were published under.
    pub tid: Option<Tid>,
    /// Resources created.
    pub added: BTreeMap<Oid, IndexFields>,
    /// Resources whose state changed.
    pub modified: BTreeMap<Oid, IndexFields>,
    /// Resources deleted.
    pub removed: Vec<Oid>,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub(crate) fn record_added(&mut self, write: &ObjectWrite, tid: Tid) {
        self.added.insert(write.oid, index_fields(write, tid));
    }

    pub(crate) fn record_modified(&mut self, write: &ObjectWrite, tid: Tid) {
        self.modified.insert(write.oid, index_fields(write, tid));
    }

    pub(crate) fn record_removed(&mut self, oid: Oid) {
        self.removed.push(oid);
    }
}

fn index_fields(write: &ObjectWrite, tid: Tid) -> IndexFields {
    let mut fields = Map::new();
    fields.insert("type_name".into(), Value::from(write.type_name.clone()));
    fields.insert(
        "parent".into(),
        write
            .parent_oid
            .map_or(Value::Null, |p| Value::from(p.to_string())),
    );
    fields.insert(
        "name".into(),
        write.name.clone().map_or(Value::Null, Value::from),
    );
    fields.insert("tid".into(), Value::from(tid.as_u64()));
    fields
}

/// Receiver of committed changes (catalog, search indexer).
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Indexes newly created resources.
    async fn index(&self, added: &BTreeMap<Oid, IndexFields>) -> Result<(), SinkError>;

    /// Reindexes modified resources.
    async fn update(&self, modified: &BTreeMap<Oid, IndexFields>) -> Result<(), SinkError>;

    /// Drops deleted resources.
    async fn remove(&self, removed: &[Oid]) -> Result<(), SinkError>;
}

/// Delivers `changes` to `sink`, returning the number of failed calls.
pub(crate) async fn deliver(sink: &dyn ChangeSink, changes: &ChangeSet) -> usize {
    let mut failures = 0;

    if !changes.removed.is_empty() {
        if let Err(e) = sink.remove(&changes.removed).await {
            warn!(tid = ?changes.tid, error = %e, "change sink remove failed");
            failures += 1;
        }
    }
    if !changes.added.is_empty() {
        if let Err(e) = sink.index(&changes.added).await {
            warn!(tid = ?changes.tid, error = %e, "change sink index failed");
            failures += 1;
        }
    }
    if !changes.modified.is_empty() {
        if let Err(e) = sink.update(&changes.modified).await {
            warn!(tid = ?changes.tid, error = %e, "change sink update failed");
            failures += 1;
        }
    }

    failures
}
