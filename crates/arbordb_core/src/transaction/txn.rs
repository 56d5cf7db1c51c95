//! A single unit of work.

use super::state::{PendingOp, PendingWrite, TransactionState};
use crate::blob::BlobWriter;
use crate::context::ContextHandle;
use crate::error::{CoreError, CoreResult};
use crate::notify::ChangeSet;
use crate::types::TxnId;
use arbordb_storage::{
    BlobId, Connection, ObjectKind, ObjectRecord, ObjectWrite, Oid, StorageBackend, StorageError,
    Tid,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

struct TxnInner {
    state: TransactionState,
    start_tid: Option<Tid>,
    tid: Option<Tid>,
    /// First serial observed per oid.
    reads: HashMap<Oid, Tid>,
    /// Ordered so commits replay deterministically.
    writes: BTreeMap<Oid, PendingWrite>,
    blob_activity: bool,
    changes: Option<ChangeSet>,
}

/// A transaction: read set, write set and two-phase commit.
///
/// Transactions are created by the [`TransactionManager`], which also
/// commits and aborts them. Writes are staged in memory and only reach the
/// backend at commit; blob chunks are streamed to the backend right away
/// but stay invisible until the same commit publishes them.
///
/// Reads of objects this transaction has staged see the staged version.
/// Container navigation ([`get_child`], [`keys`], ...) sees committed state.
///
/// [`TransactionManager`]: crate::TransactionManager
/// [`get_child`]: Transaction::get_child
/// [`keys`]: Transaction::keys
pub struct Transaction {
    id: TxnId,
    backend: Arc<dyn StorageBackend>,
    principal: Option<String>,
    blob_chunk_size: usize,
    context: ContextHandle,
    inner: Mutex<TxnInner>,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        backend: Arc<dyn StorageBackend>,
        principal: Option<String>,
        blob_chunk_size: usize,
        context: ContextHandle,
    ) -> Self {
        Self {
            id,
            backend,
            principal,
            blob_chunk_size,
            context,
            inner: Mutex::new(TxnInner {
                state: TransactionState::NotStarted,
                start_tid: None,
                tid: None,
                reads: HashMap::new(),
                writes: BTreeMap::new(),
                blob_activity: false,
                changes: None,
            }),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    // === Accessors ===

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the principal the transaction acts for.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Checks if the transaction still accepts reads and writes.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Tid current when the transaction began.
    #[must_use]
    pub fn start_tid(&self) -> Option<Tid> {
        self.inner.lock().start_tid
    }

    /// Tid the transaction was published under.
    ///
    /// `None` until commit, and for transactions that wrote nothing.
    #[must_use]
    pub fn tid(&self) -> Option<Tid> {
        self.inner.lock().tid
    }

    /// Serial observed when `oid` was first read.
    #[must_use]
    pub fn read_serial(&self, oid: Oid) -> Option<Tid> {
        self.inner.lock().reads.get(&oid).copied()
    }

    /// The write staged for `oid`.
    #[must_use]
    pub fn pending_write(&self, oid: Oid) -> Option<PendingWrite> {
        self.inner.lock().writes.get(&oid).cloned()
    }

    /// Number of staged writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    /// Resources changed by the commit, once committed.
    #[must_use]
    pub fn changes(&self) -> Option<ChangeSet> {
        self.inner.lock().changes.clone()
    }

    /// Returns true while the transaction holds a backend connection.
    #[must_use]
    pub fn holds_connection(&self) -> bool {
        self.conn.try_lock().map_or(true, |conn| conn.is_some())
    }

    /// Chunk size used by [`blob_writer`](Transaction::blob_writer).
    #[must_use]
    pub fn blob_chunk_size(&self) -> usize {
        self.blob_chunk_size
    }

    fn no_connection(&self) -> CoreError {
        CoreError::invalid_operation(format!("{} holds no connection", self.id))
    }

    fn ensure_active(&self) -> CoreResult<()> {
        self.inner.lock().state.ensure_active()
    }

    fn observe(&self, record: &ObjectRecord) {
        let mut inner = self.inner.lock();
        if !inner.writes.contains_key(&record.oid) {
            inner.reads.entry(record.oid).or_insert(record.serial);
        }
    }

    // === Lifecycle ===

    /// Opens the backend transaction on `conn`.
    ///
    /// On failure the connection is returned to the pool.
    pub(crate) async fn begin(&self, conn: Connection) -> CoreResult<Tid> {
        if self.state() != TransactionState::NotStarted {
            self.backend.close(conn).await?;
            return Err(CoreError::invalid_operation(format!(
                "{} was already started",
                self.id
            )));
        }

        let start = match self.backend.start_transaction(&conn).await {
            Ok(start) => start,
            Err(e) => {
                if let Err(close) = self.backend.close(conn).await {
                    warn!(txn = %self.id, error = %close, "closing connection failed");
                }
                return Err(e.into());
            }
        };

        *self.conn.lock().await = Some(conn);
        {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Active;
            inner.start_tid = Some(start);
        }
        debug!(txn = %self.id, start = %start, "transaction begun");
        Ok(start)
    }

    /// Commits and releases the connection.
    ///
    /// Returns the published tid, or `None` if nothing was written. The
    /// transaction ends `Committed` on success and `Aborted` on any error.
    pub(crate) async fn commit(&self) -> CoreResult<Option<Tid>> {
        let (start, writes, observed, blob_activity) = {
            let mut inner = self.inner.lock();
            inner.state.ensure_active()?;
            inner.state = TransactionState::Committing;
            (
                inner.start_tid.unwrap_or(Tid::ZERO),
                std::mem::take(&mut inner.writes),
                inner.reads.keys().copied().collect::<HashSet<_>>(),
                inner.blob_activity,
            )
        };

        let result = {
            let guard = self.conn.lock().await;
            match guard.as_ref() {
                Some(conn) => {
                    let outcome = self
                        .publish(conn, start, &writes, &observed, blob_activity)
                        .await;
                    if outcome.is_err() {
                        if let Err(e) = self.backend.abort(conn).await {
                            warn!(txn = %self.id, error = %e, "backend abort failed");
                        }
                    }
                    outcome
                }
                None => Err(self.no_connection()),
            }
        };

        self.release().await;

        let mut inner = self.inner.lock();
        inner.reads.clear();
        match &result {
            Ok(tid) => {
                inner.state = TransactionState::Committed;
                inner.tid = *tid;
                inner.changes = Some(collect_changes(*tid, &writes));
                debug!(txn = %self.id, tid = ?tid, writes = writes.len(), "transaction committed");
            }
            Err(e) => {
                inner.state = TransactionState::Aborted;
                debug!(txn = %self.id, error = %e, "commit failed, transaction aborted");
            }
        }
        result
    }

    async fn publish(
        &self,
        conn: &Connection,
        start: Tid,
        writes: &BTreeMap<Oid, PendingWrite>,
        observed: &HashSet<Oid>,
        blob_activity: bool,
    ) -> CoreResult<Option<Tid>> {
        let fault = |e: StorageError| CoreError::commit_fault(self.id, e);

        if writes.is_empty() && !blob_activity {
            self.backend.abort(conn).await.map_err(fault)?;
            return Ok(None);
        }

        self.backend.get_next_tid(conn).await.map_err(fault)?;

        // The store-time serial check exits early; the conflict query below
        // is the authoritative validation.
        let mut conflicts = Vec::new();
        for (oid, pending) in writes {
            let staged = match &pending.op {
                PendingOp::Store(write) => self
                    .backend
                    .store(conn, *oid, pending.expected, write)
                    .await
                    .map(|_| ()),
                PendingOp::Delete { .. } => self.backend.delete(conn, *oid).await,
            };
            match staged {
                Ok(()) => {}
                Err(StorageError::ConflictDetected { oid, .. } | StorageError::NotFound { oid }) => {
                    conflicts.push(oid);
                }
                Err(e) => return Err(fault(e)),
            }
        }

        let committed_since = self.backend.get_conflicts(conn, start).await.map_err(fault)?;
        conflicts.extend(
            committed_since
                .into_iter()
                .filter(|oid| writes.contains_key(oid) || observed.contains(oid)),
        );
        if !conflicts.is_empty() {
            return Err(CoreError::conflict(Some(self.id), conflicts));
        }

        let tid = self.backend.commit(conn).await.map_err(fault)?;
        Ok(Some(tid))
    }

    /// Discards everything and releases the connection.
    ///
    /// Returns false if the transaction had already finished, or is being
    /// committed (the commit owns the teardown then). Never fails.
    pub(crate) async fn abort(&self) -> bool {
        let previous = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Committed
                | TransactionState::Aborted
                | TransactionState::Committing => return false,
                previous => {
                    inner.state = TransactionState::Aborted;
                    inner.writes.clear();
                    inner.reads.clear();
                    previous
                }
            }
        };

        if previous == TransactionState::Active {
            let guard = self.conn.lock().await;
            if let Some(conn) = guard.as_ref() {
                if let Err(e) = self.backend.abort(conn).await {
                    warn!(txn = %self.id, error = %e, "backend abort failed");
                }
            }
        }
        self.release().await;
        debug!(txn = %self.id, "transaction aborted");
        true
    }

    async fn release(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err(e) = self.backend.close(conn).await {
                warn!(txn = %self.id, error = %e, "closing connection failed");
            }
        }
    }

    /// Drops the context binding, if it still points here.
    pub(crate) fn detach(&self) {
        self.context.unbind(self);
    }

    // === Objects ===

    /// Loads an object and records the observed serial.
    ///
    /// Objects staged by this transaction are returned as staged: their
    /// serial is the one first observed, or [`Tid::ZERO`] for new objects.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the object does not exist or was
    /// deleted by this transaction.
    pub async fn get(&self, oid: Oid) -> CoreResult<ObjectRecord> {
        let staged = {
            let inner = self.inner.lock();
            inner.state.ensure_active()?;
            inner.writes.get(&oid).cloned()
        };
        if let Some(pending) = staged {
            return match pending.op {
                PendingOp::Store(write) => {
                    Ok(write.into_record(pending.expected.unwrap_or(Tid::ZERO)))
                }
                PendingOp::Delete { .. } => Err(CoreError::NotFound { oid }),
            };
        }

        let record = {
            let guard = self.conn.lock().await;
            let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
            self.backend.load(conn, oid).await?
        };
        self.observe(&record);
        Ok(record)
    }

    /// Stages a new object.
    ///
    /// # Errors
    ///
    /// Fails if the object was already read or staged by this transaction.
    pub fn add(&self, write: ObjectWrite) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_active()?;
        let expected = match inner.writes.get(&write.oid) {
            Some(PendingWrite {
                op: PendingOp::Store(_),
                ..
            }) => {
                return Err(CoreError::invalid_operation(format!(
                    "{} is already staged",
                    write.oid
                )))
            }
            // Re-creating an object deleted earlier in this transaction.
            Some(deleted) => deleted.expected,
            None if inner.reads.contains_key(&write.oid) => {
                return Err(CoreError::invalid_operation(format!(
                    "{} already exists",
                    write.oid
                )))
            }
            None => None,
        };
        inner
            .writes
            .insert(write.oid, PendingWrite::store(expected, write));
        Ok(())
    }

    /// Stages a new state for an existing object.
    ///
    /// Loads the object first if this transaction has not seen it yet.
    pub async fn update(&self, write: ObjectWrite) -> CoreResult<()> {
        let oid = write.oid;
        let known = {
            let inner = self.inner.lock();
            inner.state.ensure_active()?;
            match inner.writes.get(&oid) {
                Some(PendingWrite {
                    op: PendingOp::Delete { .. },
                    ..
                }) => return Err(CoreError::NotFound { oid }),
                Some(pending) => Some(pending.expected),
                None => inner.reads.get(&oid).map(|serial| Some(*serial)),
            }
        };

        let expected = match known {
            Some(expected) => expected,
            None => Some(self.get(oid).await?.serial),
        };

        let mut inner = self.inner.lock();
        inner.state.ensure_active()?;
        inner.writes.insert(oid, PendingWrite::store(expected, write));
        Ok(())
    }

    /// Stages deletion of an object.
    ///
    /// Deleting an object created by this transaction simply unstages it.
    pub async fn delete(&self, oid: Oid) -> CoreResult<()> {
        if oid == Oid::ROOT {
            return Err(CoreError::invalid_operation("the root cannot be deleted"));
        }

        let known = {
            let inner = self.inner.lock();
            inner.state.ensure_active()?;
            match inner.writes.get(&oid) {
                Some(PendingWrite {
                    op: PendingOp::Store(write),
                    expected,
                }) => Some((*expected, write.kind)),
                Some(_) => return Err(CoreError::NotFound { oid }),
                None => None,
            }
        };

        let (expected, kind): (Option<Tid>, ObjectKind) = match known {
            Some(known) => known,
            None => {
                let record = self.get(oid).await?;
                (Some(record.serial), record.kind)
            }
        };

        let mut inner = self.inner.lock();
        inner.state.ensure_active()?;
        match expected {
            None => {
                inner.writes.remove(&oid);
            }
            Some(_) => {
                inner.writes.insert(oid, PendingWrite::delete(expected, kind));
            }
        }
        Ok(())
    }

    // === Containers ===

    /// Returns the child of `parent` named `name`.
    pub async fn get_child(&self, parent: Oid, name: &str) -> CoreResult<Option<ObjectRecord>> {
        self.ensure_active()?;
        let child = {
            let guard = self.conn.lock().await;
            let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
            self.backend.get_child(conn, parent, name).await?
        };
        if let Some(record) = &child {
            self.observe(record);
        }
        Ok(child)
    }

    /// Returns true if `parent` has a child named `name`.
    pub async fn has_key(&self, parent: Oid, name: &str) -> CoreResult<bool> {
        self.ensure_active()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        Ok(self.backend.has_key(conn, parent, name).await?)
    }

    /// Number of children of `parent`.
    pub async fn len(&self, parent: Oid) -> CoreResult<usize> {
        self.ensure_active()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        Ok(self.backend.len(conn, parent).await?)
    }

    /// Sorted child names of `parent`.
    pub async fn keys(&self, parent: Oid) -> CoreResult<Vec<String>> {
        self.ensure_active()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        Ok(self.backend.keys(conn, parent).await?)
    }

    /// Children of `parent`, sorted by name.
    pub async fn items(&self, parent: Oid) -> CoreResult<Vec<ObjectRecord>> {
        self.ensure_active()?;
        let items = {
            let guard = self.conn.lock().await;
            let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
            self.backend.items(conn, parent).await?
        };
        for record in &items {
            self.observe(record);
        }
        Ok(items)
    }

    /// One page of child names; pages are numbered from 1.
    pub async fn get_page_of_keys(
        &self,
        parent: Oid,
        page: usize,
        page_size: usize,
    ) -> CoreResult<Vec<String>> {
        self.ensure_active()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        Ok(self
            .backend
            .get_page_of_keys(conn, parent, page, page_size)
            .await?)
    }

    /// Returns the annotation of `owner` named `name`.
    pub async fn get_annotation(&self, owner: Oid, name: &str) -> CoreResult<Option<ObjectRecord>> {
        self.ensure_active()?;
        let annotation = {
            let guard = self.conn.lock().await;
            let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
            self.backend.get_annotation(conn, owner, name).await?
        };
        if let Some(record) = &annotation {
            self.observe(record);
        }
        Ok(annotation)
    }

    /// Sorted annotation names of `owner`.
    pub async fn get_annotation_keys(&self, owner: Oid) -> CoreResult<Vec<String>> {
        self.ensure_active()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        Ok(self.backend.get_annotation_keys(conn, owner).await?)
    }

    // === Blobs ===

    /// Starts a chunked blob owned by `oid`.
    #[must_use]
    pub fn blob_writer(&self, oid: Oid) -> BlobWriter<'_> {
        BlobWriter::new(self, oid)
    }

    fn mark_blob_activity(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_active()?;
        inner.blob_activity = true;
        Ok(())
    }

    pub(crate) async fn write_blob_chunk(
        &self,
        blob_id: BlobId,
        oid: Oid,
        chunk_index: u32,
        data: Bytes,
    ) -> CoreResult<()> {
        self.mark_blob_activity()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        self.backend
            .write_blob_chunk(conn, blob_id, oid, chunk_index, data)
            .await?;
        Ok(())
    }

    pub(crate) async fn read_blob_chunk(&self, blob_id: BlobId, chunk_index: u32) -> CoreResult<Bytes> {
        self.ensure_active()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        Ok(self.backend.read_blob_chunk(conn, blob_id, chunk_index).await?)
    }

    pub(crate) async fn del_blob(&self, blob_id: BlobId) -> CoreResult<()> {
        self.mark_blob_activity()?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| self.no_connection())?;
        self.backend.del_blob(conn, blob_id).await?;
        Ok(())
    }
}

fn collect_changes(tid: Option<Tid>, writes: &BTreeMap<Oid, PendingWrite>) -> ChangeSet {
    let mut changes = ChangeSet {
        tid,
        ..ChangeSet::default()
    };
    let Some(tid) = tid else {
        return changes;
    };

    for (oid, pending) in writes {
        match &pending.op {
            PendingOp::Store(write) if write.kind == ObjectKind::Resource => {
                if pending.is_new() {
                    changes.record_added(write, tid);
                } else {
                    changes.record_modified(write, tid);
                }
            }
            PendingOp::Delete {
                kind: ObjectKind::Resource,
            } => changes.record_removed(*oid),
            _ => {}
        }
    }
    changes
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("start_tid", &inner.start_tid)
            .field("tid", &inner.tid)
            .field("reads", &inner.reads.len())
            .field("writes", &inner.writes.len())
            .finish()
    }
}
