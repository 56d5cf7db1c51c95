//! Recording change sink.

use arbordb_core::{ChangeSink, IndexFields, SinkError};
use arbordb_storage::Oid;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One call received by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// `index` with these resources.
    Index(BTreeMap<Oid, IndexFields>),
    /// `update` with these resources.
    Update(BTreeMap<Oid, IndexFields>),
    /// `remove` with these oids.
    Remove(Vec<Oid>),
}

/// A [`ChangeSink`] that remembers every call, in order.
///
/// When failing, calls are still recorded but return an error.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    fail: AtomicBool,
}

impl RecordingSink {
    /// Creates a sink that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink whose calls all fail.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    /// Switches failure mode.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Calls received so far.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Oids passed to `index`, across all calls.
    pub fn indexed(&self) -> Vec<Oid> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Index(added) => Some(added.keys().copied().collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Oids passed to `update`, across all calls.
    pub fn updated(&self) -> Vec<Oid> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Update(modified) => Some(modified.keys().copied().collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Oids passed to `remove`, across all calls.
    pub fn removed(&self) -> Vec<Oid> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Remove(oids) => Some(oids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn record(&self, event: SinkEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        if self.fail.load(Ordering::SeqCst) {
            Err(SinkError("recording sink set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChangeSink for RecordingSink {
    async fn index(&self, added: &BTreeMap<Oid, IndexFields>) -> Result<(), SinkError> {
        self.record(SinkEvent::Index(added.clone()))
    }

    async fn update(&self, modified: &BTreeMap<Oid, IndexFields>) -> Result<(), SinkError> {
        self.record(SinkEvent::Update(modified.clone()))
    }

    async fn remove(&self, removed: &[Oid]) -> Result<(), SinkError> {
        self.record(SinkEvent::Remove(removed.to_vec()))
    }
}
