//! In-memory storage backend, optionally persisted to a snapshot file.

use crate::backend::StorageBackend;
use crate::config::BackendConfig;
use crate::error::{StorageError, StorageResult};
use crate::file::SnapshotFile;
use crate::pool::{Connection, ConnectionId, ConnectionPool};
use crate::types::{BlobChunk, BlobId, ObjectKind, ObjectMeta, ObjectRecord, ObjectWrite, Oid, Tid};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Published state of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub(crate) objects: BTreeMap<Oid, ObjectRecord>,
    pub(crate) chunks: BTreeMap<(BlobId, u32), BlobChunk>,
    pub(crate) last_tid: Tid,
    /// Oids touched per published tid, kept while some transaction may ask.
    #[serde(skip)]
    pub(crate) commit_log: BTreeMap<Tid, Vec<Oid>>,
}

impl StoreState {
    /// A store holding only the root.
    pub(crate) fn bootstrap() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(Oid::ROOT, ObjectRecord::root());
        Self {
            objects,
            ..Self::default()
        }
    }

    fn children(&self, parent: Oid) -> impl Iterator<Item = &ObjectRecord> {
        self.objects
            .values()
            .filter(move |r| r.kind == ObjectKind::Resource && r.parent_oid == Some(parent))
    }

    fn annotations(&self, owner: Oid) -> impl Iterator<Item = &ObjectRecord> {
        self.objects
            .values()
            .filter(move |r| r.kind == ObjectKind::SubValue && r.owner_oid == Some(owner))
    }

    fn apply(&mut self, pending: &PendingTxn, tid: Tid) {
        let mut touched = Vec::with_capacity(pending.objects.len());

        for (oid, record) in &pending.objects {
            match record {
                Some(record) => {
                    self.objects.insert(*oid, record.clone());
                }
                None => {
                    self.objects.remove(oid);
                    self.chunks.retain(|_, chunk| chunk.oid != *oid);
                }
            }
            touched.push(*oid);
        }

        if !pending.deleted_blobs.is_empty() {
            self.chunks
                .retain(|(blob_id, _), _| !pending.deleted_blobs.contains(blob_id));
        }
        for (key, chunk) in &pending.chunks {
            self.chunks.insert(*key, chunk.clone());
        }

        self.last_tid = tid;
        self.commit_log.insert(tid, touched);
    }
}

/// A backend transaction open on one connection.
struct PendingTxn {
    start: Tid,
    tid: Option<Tid>,
    /// Held while the connection is inside the commit window.
    window: Option<OwnedMutexGuard<()>>,
    /// `None` stages a deletion.
    objects: BTreeMap<Oid, Option<ObjectRecord>>,
    chunks: BTreeMap<(BlobId, u32), BlobChunk>,
    deleted_blobs: BTreeSet<BlobId>,
}

impl PendingTxn {
    fn new(start: Tid) -> Self {
        Self {
            start,
            tid: None,
            window: None,
            objects: BTreeMap::new(),
            chunks: BTreeMap::new(),
            deleted_blobs: BTreeSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.chunks.is_empty() && self.deleted_blobs.is_empty()
    }
}

#[derive(Default)]
struct Session {
    txn: Option<PendingTxn>,
}

/// An in-memory object store.
///
/// This backend keeps all records in memory and is suitable for:
/// - Unit and integration tests
/// - Ephemeral stores
/// - Small durable stores, when opened with [`InMemoryBackend::open_file`]
///
/// Every backend call yields to the scheduler once before touching state,
/// so interleavings look like they would against a networked database.
///
/// # Example
///
/// ```rust
/// use arbordb_storage::{InMemoryBackend, Oid, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = InMemoryBackend::new();
/// let conn = backend.open().await.unwrap();
/// let root = backend.load(&conn, Oid::ROOT).await.unwrap();
/// assert_eq!(root.type_name, "Root");
/// backend.close(conn).await.unwrap();
/// # });
/// ```
pub struct InMemoryBackend {
    name: String,
    pool: ConnectionPool,
    state: RwLock<StoreState>,
    sessions: Mutex<HashMap<ConnectionId, Session>>,
    commit_window: Arc<tokio::sync::Mutex<()>>,
    snapshot: Option<SnapshotFile>,
    /// Orders snapshot writes; held from reading the state until the new
    /// state is installed.
    persist: tokio::sync::Mutex<()>,
    read_only: bool,
}

impl InMemoryBackend {
    /// Creates an empty store (root only) with the default pool.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&BackendConfig::memory())
    }

    /// Creates an empty store using the pool settings of `config`.
    #[must_use]
    pub fn with_config(config: &BackendConfig) -> Self {
        Self::from_state(config, StoreState::bootstrap(), None)
    }

    /// Opens a store persisted at `config.path`, creating it on first publish.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is missing or the snapshot cannot be read.
    pub fn open_file(config: &BackendConfig) -> StorageResult<Self> {
        let path: PathBuf = config
            .path
            .clone()
            .ok_or_else(|| StorageError::InvalidConfig("file backend requires a path".into()))?;
        let snapshot = SnapshotFile::new(path);
        let state = snapshot.load()?.unwrap_or_else(StoreState::bootstrap);
        debug!(path = %snapshot.path().display(), objects = state.objects.len(), "opened snapshot");
        Ok(Self::from_state(config, state, Some(snapshot)))
    }

    fn from_state(config: &BackendConfig, state: StoreState, snapshot: Option<SnapshotFile>) -> Self {
        Self {
            name: config.backend.clone(),
            pool: ConnectionPool::new(config.pool_size, config.acquire_timeout),
            state: RwLock::new(state),
            sessions: Mutex::new(HashMap::new()),
            commit_window: Arc::new(tokio::sync::Mutex::new(())),
            snapshot,
            persist: tokio::sync::Mutex::new(()),
            read_only: config.read_only,
        }
    }

    /// Writes a record directly into the published state.
    ///
    /// Bypasses transactions, conflict detection and tid assignment. Meant
    /// for tests and repair tooling.
    pub async fn put_record(&self, record: ObjectRecord) -> StorageResult<()> {
        self.mutate(|state| {
            state.objects.insert(record.oid, record);
        })
        .await
    }

    /// Returns a copy of a published record.
    #[must_use]
    pub fn record(&self, oid: Oid) -> Option<ObjectRecord> {
        self.state.read().objects.get(&oid).cloned()
    }

    /// Number of published objects, the root included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Number of published blob chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Number of entries retained for conflict detection.
    #[must_use]
    pub fn commit_log_len(&self) -> usize {
        self.state.read().commit_log.len()
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    /// Applies `f` to the published state, persisting first when file-backed.
    ///
    /// A file-backed store applies `f` to a copy of the whole state and
    /// writes the snapshot on the blocking pool; readers keep seeing the
    /// previous state until the write succeeded.
    async fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> StorageResult<R> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(f(&mut self.state.write()));
        };

        let _persist = self.persist.lock().await;
        let mut next = self.state.read().clone();
        let result = f(&mut next);
        let bytes = SnapshotFile::encode(&next)?;

        let file = snapshot.clone();
        tokio::task::spawn_blocking(move || file.write(&bytes))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        *self.state.write() = next;
        Ok(result)
    }

    fn with_txn<R>(
        &self,
        conn: &Connection,
        f: impl FnOnce(&mut PendingTxn) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let mut sessions = self.sessions.lock();
        let txn = sessions
            .get_mut(&conn.id())
            .and_then(|s| s.txn.as_mut())
            .ok_or(StorageError::NoTransaction {
                connection: conn.id(),
            })?;
        f(txn)
    }

    /// The staged version of `oid` on `conn`, if any.
    fn staged(&self, conn: &Connection, oid: Oid) -> Option<Option<ObjectRecord>> {
        let sessions = self.sessions.lock();
        sessions
            .get(&conn.id())
            .and_then(|s| s.txn.as_ref())
            .and_then(|t| t.objects.get(&oid).cloned())
    }

    /// Number of connections the backend holds state for.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Forgets sessions whose connection was dropped without `close`.
    ///
    /// A forgotten session no longer pins the commit log, and a commit
    /// window it held is released with it.
    fn reap_dropped(&self) {
        let dropped = self.pool.take_released();
        if dropped.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock();
        let reaped: Vec<Session> = dropped.iter().filter_map(|id| sessions.remove(id)).collect();
        drop(sessions);
        if !reaped.is_empty() {
            debug!(sessions = reaped.len(), "discarded sessions of dropped connections");
        }
    }

    fn oldest_active_start(&self) -> Option<Tid> {
        self.sessions
            .lock()
            .values()
            .filter_map(|s| s.txn.as_ref().map(|t| t.start))
            .min()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("name", &self.name)
            .field("object_count", &self.object_count())
            .field("connections_in_use", &self.pool.in_use())
            .field("persistent", &self.snapshot.is_some())
            .finish()
    }
}

/// Simulated round trip to the database.
async fn round_trip() {
    tokio::task::yield_now().await;
}

fn page_bounds(page: usize, page_size: usize) -> (usize, usize) {
    (page.max(1).saturating_sub(1).saturating_mul(page_size), page_size)
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn open(&self) -> StorageResult<Connection> {
        let conn = self.pool.acquire().await?;
        self.reap_dropped();
        self.sessions.lock().insert(conn.id(), Session::default());
        Ok(conn)
    }

    async fn close(&self, conn: Connection) -> StorageResult<()> {
        // Dropping the session also leaves the commit window.
        self.sessions.lock().remove(&conn.id());
        drop(conn);
        Ok(())
    }

    async fn start_transaction(&self, conn: &Connection) -> StorageResult<Tid> {
        round_trip().await;
        let current = self.state.read().last_tid;
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&conn.id()).ok_or(StorageError::NoTransaction {
            connection: conn.id(),
        })?;
        session.txn = Some(PendingTxn::new(current));
        Ok(current)
    }

    async fn get_next_tid(&self, conn: &Connection) -> StorageResult<Tid> {
        round_trip().await;
        self.ensure_writable()?;
        if let Some(tid) = self.with_txn(conn, |txn| Ok(txn.tid))? {
            return Ok(tid);
        }

        self.reap_dropped();
        let window = Arc::clone(&self.commit_window).lock_owned().await;
        // Nobody else can publish while we hold the window.
        let tid = self.state.read().last_tid.next();
        self.with_txn(conn, move |txn| {
            txn.tid = Some(tid);
            txn.window = Some(window);
            Ok(tid)
        })
    }

    async fn get_current_tid(&self, _conn: &Connection) -> StorageResult<Tid> {
        round_trip().await;
        Ok(self.state.read().last_tid)
    }

    async fn get_conflicts(&self, _conn: &Connection, since: Tid) -> StorageResult<HashSet<Oid>> {
        round_trip().await;
        let state = self.state.read();
        Ok(state
            .commit_log
            .range(since.next()..)
            .flat_map(|(_, oids)| oids.iter().copied())
            .collect())
    }

    async fn commit(&self, conn: &Connection) -> StorageResult<Tid> {
        round_trip().await;
        let pending = {
            let mut sessions = self.sessions.lock();
            sessions
                .get_mut(&conn.id())
                .and_then(|s| s.txn.take())
                .ok_or(StorageError::NoTransaction {
                    connection: conn.id(),
                })?
        };

        let Some(tid) = pending.tid else {
            if pending.is_empty() {
                return Ok(self.state.read().last_tid);
            }
            return Err(StorageError::NoTransaction {
                connection: conn.id(),
            });
        };

        self.reap_dropped();
        let oldest = self.oldest_active_start();
        self.mutate(|state| {
            state.apply(&pending, tid);
            let keep_after = oldest.unwrap_or(tid);
            state.commit_log.retain(|logged, _| *logged > keep_after);
        })
        .await?;

        debug!(connection = %conn.id(), %tid, objects = pending.objects.len(), "published");
        // `pending` (and the commit window with it) is released here.
        Ok(tid)
    }

    async fn abort(&self, conn: &Connection) -> StorageResult<()> {
        round_trip().await;
        if let Some(session) = self.sessions.lock().get_mut(&conn.id()) {
            session.txn = None;
        }
        Ok(())
    }

    async fn load(&self, conn: &Connection, oid: Oid) -> StorageResult<ObjectRecord> {
        round_trip().await;
        match self.staged(conn, oid) {
            Some(Some(record)) => Ok(record),
            Some(None) => Err(StorageError::NotFound { oid }),
            None => self
                .state
                .read()
                .objects
                .get(&oid)
                .cloned()
                .ok_or(StorageError::NotFound { oid }),
        }
    }

    async fn store(
        &self,
        conn: &Connection,
        oid: Oid,
        expected_serial: Option<Tid>,
        write: &ObjectWrite,
    ) -> StorageResult<Tid> {
        round_trip().await;
        self.ensure_writable()?;
        let actual = self.state.read().objects.get(&oid).map(|r| r.serial);

        self.with_txn(conn, |txn| {
            let tid = txn.tid.ok_or(StorageError::NoTransaction {
                connection: conn.id(),
            })?;
            if actual != expected_serial {
                return Err(StorageError::ConflictDetected {
                    oid,
                    expected: expected_serial,
                    actual,
                });
            }
            txn.objects.insert(oid, Some(write.clone().into_record(tid)));
            Ok(tid)
        })
    }

    async fn delete(&self, conn: &Connection, oid: Oid) -> StorageResult<()> {
        round_trip().await;
        self.ensure_writable()?;
        let exists = self.state.read().objects.contains_key(&oid);

        self.with_txn(conn, |txn| {
            let staged = matches!(txn.objects.get(&oid), Some(Some(_)));
            if !exists && !staged {
                return Err(StorageError::NotFound { oid });
            }
            txn.objects.insert(oid, None);
            txn.chunks.retain(|_, chunk| chunk.oid != oid);
            Ok(())
        })
    }

    async fn get_child(
        &self,
        _conn: &Connection,
        parent: Oid,
        name: &str,
    ) -> StorageResult<Option<ObjectRecord>> {
        round_trip().await;
        let state = self.state.read();
        let child = state
            .children(parent)
            .find(|r| r.name.as_deref() == Some(name))
            .cloned();
        Ok(child)
    }

    async fn has_key(&self, conn: &Connection, parent: Oid, name: &str) -> StorageResult<bool> {
        Ok(self.get_child(conn, parent, name).await?.is_some())
    }

    async fn len(&self, _conn: &Connection, parent: Oid) -> StorageResult<usize> {
        round_trip().await;
        Ok(self.state.read().children(parent).count())
    }

    async fn keys(&self, _conn: &Connection, parent: Oid) -> StorageResult<Vec<String>> {
        round_trip().await;
        let state = self.state.read();
        let mut keys: Vec<String> = state.children(parent).filter_map(|r| r.name.clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn items(&self, _conn: &Connection, parent: Oid) -> StorageResult<Vec<ObjectRecord>> {
        round_trip().await;
        let state = self.state.read();
        let mut items: Vec<ObjectRecord> = state.children(parent).cloned().collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn get_page_of_keys(
        &self,
        conn: &Connection,
        parent: Oid,
        page: usize,
        page_size: usize,
    ) -> StorageResult<Vec<String>> {
        let (skip, take) = page_bounds(page, page_size);
        let keys = self.keys(conn, parent).await?;
        Ok(keys.into_iter().skip(skip).take(take).collect())
    }

    async fn get_annotation(
        &self,
        _conn: &Connection,
        owner: Oid,
        name: &str,
    ) -> StorageResult<Option<ObjectRecord>> {
        round_trip().await;
        let state = self.state.read();
        let annotation = state
            .annotations(owner)
            .find(|r| r.name.as_deref() == Some(name))
            .cloned();
        Ok(annotation)
    }

    async fn get_annotation_keys(
        &self,
        _conn: &Connection,
        owner: Oid,
    ) -> StorageResult<Vec<String>> {
        round_trip().await;
        let state = self.state.read();
        let mut keys: Vec<String> = state.annotations(owner).filter_map(|r| r.name.clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_total_number_of_objects(&self, _conn: &Connection) -> StorageResult<u64> {
        round_trip().await;
        Ok(self.state.read().objects.len() as u64)
    }

    async fn get_total_number_of_resources(&self, _conn: &Connection) -> StorageResult<u64> {
        round_trip().await;
        let state = self.state.read();
        Ok(state.objects.values().filter(|r| r.is_resource()).count() as u64)
    }

    async fn get_total_resources_of_type(
        &self,
        _conn: &Connection,
        type_name: &str,
    ) -> StorageResult<u64> {
        round_trip().await;
        let state = self.state.read();
        Ok(state
            .objects
            .values()
            .filter(|r| r.is_resource() && r.type_name == type_name)
            .count() as u64)
    }

    async fn get_page_of_resources_of_type(
        &self,
        _conn: &Connection,
        type_name: &str,
        page: usize,
        page_size: usize,
    ) -> StorageResult<Vec<ObjectRecord>> {
        round_trip().await;
        let (skip, take) = page_bounds(page, page_size);
        let state = self.state.read();
        Ok(state
            .objects
            .values()
            .filter(|r| r.is_resource() && r.type_name == type_name)
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }

    async fn write_blob_chunk(
        &self,
        conn: &Connection,
        blob_id: BlobId,
        oid: Oid,
        chunk_index: u32,
        data: Bytes,
    ) -> StorageResult<()> {
        round_trip().await;
        self.ensure_writable()?;
        self.with_txn(conn, |txn| {
            txn.chunks
                .insert((blob_id, chunk_index), BlobChunk { oid, data });
            Ok(())
        })
    }

    async fn read_blob_chunk(
        &self,
        conn: &Connection,
        blob_id: BlobId,
        chunk_index: u32,
    ) -> StorageResult<Bytes> {
        round_trip().await;
        let key = (blob_id, chunk_index);
        let staged = {
            let sessions = self.sessions.lock();
            match sessions.get(&conn.id()).and_then(|s| s.txn.as_ref()) {
                Some(txn) => match txn.chunks.get(&key) {
                    Some(chunk) => Some(Some(chunk.data.clone())),
                    None if txn.deleted_blobs.contains(&blob_id) => Some(None),
                    None => None,
                },
                None => None,
            }
        };

        let data = match staged {
            Some(data) => data,
            None => self.state.read().chunks.get(&key).map(|c| c.data.clone()),
        };
        data.ok_or(StorageError::BlobChunkNotFound {
            blob_id,
            chunk_index,
        })
    }

    async fn del_blob(&self, conn: &Connection, blob_id: BlobId) -> StorageResult<()> {
        round_trip().await;
        self.ensure_writable()?;
        self.with_txn(conn, |txn| {
            txn.chunks.retain(|(id, _), _| *id != blob_id);
            txn.deleted_blobs.insert(blob_id);
            Ok(())
        })
    }

    async fn get_page_of_object_metadata(
        &self,
        _conn: &Connection,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Vec<ObjectMeta>> {
        round_trip().await;
        let state = self.state.read();
        Ok(state
            .objects
            .values()
            .skip(offset)
            .take(limit)
            .map(ObjectRecord::meta)
            .collect())
    }

    async fn delete_blobs_of_objects(&self, _conn: &Connection, oids: &[Oid]) -> StorageResult<u64> {
        round_trip().await;
        self.ensure_writable()?;
        let targets: HashSet<Oid> = oids.iter().copied().collect();
        self.mutate(|state| {
            let before = state.chunks.len();
            state.chunks.retain(|_, chunk| !targets.contains(&chunk.oid));
            (before - state.chunks.len()) as u64
        })
        .await
    }

    async fn delete_objects(&self, _conn: &Connection, oids: &[Oid]) -> StorageResult<u64> {
        round_trip().await;
        self.ensure_writable()?;
        self.mutate(|state| {
            oids.iter()
                .filter(|oid| state.objects.remove(oid).is_some())
                .count() as u64
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn folder(name: &str) -> ObjectWrite {
        ObjectWrite::resource(Oid::new(), Oid::ROOT, name, "Folder", Bytes::from_static(b"{}"))
    }

    async fn commit_writes(backend: &InMemoryBackend, writes: &[ObjectWrite]) -> Tid {
        let conn = backend.open().await.unwrap();
        backend.start_transaction(&conn).await.unwrap();
        backend.get_next_tid(&conn).await.unwrap();
        for write in writes {
            backend.store(&conn, write.oid, None, write).await.unwrap();
        }
        let tid = backend.commit(&conn).await.unwrap();
        backend.close(conn).await.unwrap();
        tid
    }

    #[tokio::test]
    async fn new_store_holds_root() {
        let backend = InMemoryBackend::new();
        let conn = backend.open().await.unwrap();
        let root = backend.load(&conn, Oid::ROOT).await.unwrap();
        assert_eq!(root.serial, Tid::ZERO);
        assert_eq!(backend.get_current_tid(&conn).await.unwrap(), Tid::ZERO);
        backend.close(conn).await.unwrap();
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let backend = InMemoryBackend::new();
        let conn = backend.open().await.unwrap();
        let result = backend.load(&conn, Oid::new()).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn staged_writes_invisible_until_commit() {
        let backend = InMemoryBackend::new();
        let writer = backend.open().await.unwrap();
        let reader = backend.open().await.unwrap();
        let write = folder("a");

        backend.start_transaction(&writer).await.unwrap();
        let tid = backend.get_next_tid(&writer).await.unwrap();
        let serial = backend.store(&writer, write.oid, None, &write).await.unwrap();
        assert_eq!(serial, tid);

        assert!(backend.load(&reader, write.oid).await.is_err());
        assert!(backend.load(&writer, write.oid).await.is_ok());

        assert_eq!(backend.commit(&writer).await.unwrap(), tid);
        assert_eq!(backend.load(&reader, write.oid).await.unwrap().serial, tid);
    }

    #[tokio::test]
    async fn tids_increase_per_commit() {
        let backend = InMemoryBackend::new();
        let t1 = commit_writes(&backend, &[folder("a")]).await;
        let t2 = commit_writes(&backend, &[folder("b")]).await;
        assert_eq!(t1, Tid::new(1));
        assert_eq!(t2, Tid::new(2));
    }

    #[tokio::test]
    async fn aborted_reservation_is_not_published() {
        let backend = InMemoryBackend::new();
        let conn = backend.open().await.unwrap();
        backend.start_transaction(&conn).await.unwrap();
        let reserved = backend.get_next_tid(&conn).await.unwrap();
        backend.abort(&conn).await.unwrap();
        assert_eq!(backend.get_current_tid(&conn).await.unwrap(), Tid::ZERO);

        let published = commit_writes(&backend, &[folder("a")]).await;
        assert_eq!(published, reserved);
    }

    #[tokio::test]
    async fn dropped_connection_stops_pinning_commit_log() {
        let backend = InMemoryBackend::new();
        let abandoned = backend.open().await.unwrap();
        backend.start_transaction(&abandoned).await.unwrap();

        commit_writes(&backend, &[folder("a")]).await;
        commit_writes(&backend, &[folder("b")]).await;
        assert_eq!(backend.commit_log_len(), 2);

        drop(abandoned);
        commit_writes(&backend, &[folder("c")]).await;
        assert_eq!(backend.commit_log_len(), 0);
        assert_eq!(backend.session_count(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_leaves_commit_window() {
        let backend = InMemoryBackend::new();
        let abandoned = backend.open().await.unwrap();
        backend.start_transaction(&abandoned).await.unwrap();
        backend.get_next_tid(&abandoned).await.unwrap();
        drop(abandoned);

        let tid = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            commit_writes(&backend, &[folder("a")]),
        )
        .await
        .expect("commit window was never released");
        assert_eq!(tid, Tid::new(1));
    }

    #[tokio::test]
    async fn store_checks_expected_serial() {
        let backend = InMemoryBackend::new();
        let write = folder("a");
        commit_writes(&backend, &[write.clone()]).await;

        let conn = backend.open().await.unwrap();
        backend.start_transaction(&conn).await.unwrap();
        backend.get_next_tid(&conn).await.unwrap();
        let result = backend.store(&conn, write.oid, None, &write).await;
        assert!(matches!(
            result,
            Err(StorageError::ConflictDetected {
                expected: None,
                actual: Some(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn store_without_tid_is_rejected() {
        let backend = InMemoryBackend::new();
        let conn = backend.open().await.unwrap();
        backend.start_transaction(&conn).await.unwrap();
        let write = folder("a");
        let result = backend.store(&conn, write.oid, None, &write).await;
        assert!(matches!(result, Err(StorageError::NoTransaction { .. })));
    }

    #[tokio::test]
    async fn conflicts_report_later_commits() {
        let backend = InMemoryBackend::new();
        let conn = backend.open().await.unwrap();
        let start = backend.start_transaction(&conn).await.unwrap();

        let write = folder("a");
        commit_writes(&backend, &[write.clone()]).await;

        let conflicts = backend.get_conflicts(&conn, start).await.unwrap();
        assert!(conflicts.contains(&write.oid));

        let current = backend.get_current_tid(&conn).await.unwrap();
        assert!(backend.get_conflicts(&conn, current).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_log_is_pruned_without_active_transactions() {
        let backend = InMemoryBackend::new();
        commit_writes(&backend, &[folder("a")]).await;
        commit_writes(&backend, &[folder("b")]).await;
        assert_eq!(backend.commit_log_len(), 0);
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let backend = InMemoryBackend::new();
        let write = folder("a");
        commit_writes(&backend, &[write.clone()]).await;

        let conn = backend.open().await.unwrap();
        let blob = BlobId::new();
        backend.start_transaction(&conn).await.unwrap();
        backend
            .write_blob_chunk(&conn, blob, write.oid, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        backend.get_next_tid(&conn).await.unwrap();
        backend.commit(&conn).await.unwrap();
        assert_eq!(backend.chunk_count(), 1);

        backend.start_transaction(&conn).await.unwrap();
        backend.get_next_tid(&conn).await.unwrap();
        backend.delete(&conn, write.oid).await.unwrap();
        backend.commit(&conn).await.unwrap();
        assert_eq!(backend.chunk_count(), 0);
        assert!(backend.record(write.oid).is_none());
    }

    #[tokio::test]
    async fn blob_chunks_stream_in_order_and_restart() {
        let backend = InMemoryBackend::new();
        let conn = backend.open().await.unwrap();
        let blob = BlobId::new();
        backend.start_transaction(&conn).await.unwrap();
        for (i, part) in [&b"ab"[..], b"cd", b"e"].iter().enumerate() {
            backend
                .write_blob_chunk(&conn, blob, Oid::ROOT, i as u32, Bytes::copy_from_slice(part))
                .await
                .unwrap();
        }

        let first: Vec<Bytes> = backend.read_blob_chunks(&conn, blob).try_collect().await.unwrap();
        let second: Vec<Bytes> = backend.read_blob_chunks(&conn, blob).try_collect().await.unwrap();
        assert_eq!(first.concat(), b"abcde");
        assert_eq!(first, second);

        backend.del_blob(&conn, blob).await.unwrap();
        let result = backend.read_blob_chunk(&conn, blob, 0).await;
        assert!(matches!(result, Err(StorageError::BlobChunkNotFound { .. })));
    }

    #[tokio::test]
    async fn navigation_and_annotations() {
        let backend = InMemoryBackend::new();
        let a = folder("a");
        let b = folder("b");
        let note = ObjectWrite::sub_value(Oid::new(), a.oid, "note", "Note", Bytes::new());
        commit_writes(&backend, &[b.clone(), a.clone(), note.clone()]).await;

        let conn = backend.open().await.unwrap();
        assert_eq!(backend.keys(&conn, Oid::ROOT).await.unwrap(), vec!["a", "b"]);
        assert_eq!(backend.len(&conn, Oid::ROOT).await.unwrap(), 2);
        assert!(backend.has_key(&conn, Oid::ROOT, "b").await.unwrap());
        assert!(!backend.has_key(&conn, Oid::ROOT, "note").await.unwrap());
        assert_eq!(
            backend.get_page_of_keys(&conn, Oid::ROOT, 2, 1).await.unwrap(),
            vec!["b"]
        );
        assert_eq!(
            backend.get_child(&conn, Oid::ROOT, "a").await.unwrap().map(|r| r.oid),
            Some(a.oid)
        );
        assert_eq!(backend.get_annotation_keys(&conn, a.oid).await.unwrap(), vec!["note"]);
        assert_eq!(
            backend.get_annotation(&conn, a.oid, "note").await.unwrap().map(|r| r.oid),
            Some(note.oid)
        );
        assert_eq!(backend.get_total_number_of_objects(&conn).await.unwrap(), 4);
        assert_eq!(backend.get_total_number_of_resources(&conn).await.unwrap(), 3);
        assert_eq!(backend.get_total_resources_of_type(&conn, "Folder").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn bulk_deletes_apply_immediately() {
        let backend = InMemoryBackend::new();
        let a = folder("a");
        commit_writes(&backend, &[a.clone()]).await;

        let conn = backend.open().await.unwrap();
        let page = backend.get_page_of_object_metadata(&conn, 0, 10).await.unwrap();
        assert_eq!(page.len(), 2);

        assert_eq!(backend.delete_objects(&conn, &[a.oid, Oid::new()]).await.unwrap(), 1);
        assert_eq!(backend.object_count(), 1);
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let backend = InMemoryBackend::with_config(&BackendConfig::memory().read_only(true));
        let conn = backend.open().await.unwrap();
        backend.start_transaction(&conn).await.unwrap();
        assert!(matches!(
            backend.get_next_tid(&conn).await,
            Err(StorageError::ReadOnly)
        ));
        assert!(matches!(
            backend.delete_objects(&conn, &[Oid::new()]).await,
            Err(StorageError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::file(dir.path().join("store.cbor"));
        let write = folder("kept");

        {
            let backend = InMemoryBackend::open_file(&config).unwrap();
            commit_writes(&backend, &[write.clone()]).await;
        }

        let backend = InMemoryBackend::open_file(&config).unwrap();
        let record = backend.record(write.oid).unwrap();
        assert_eq!(record.name.as_deref(), Some("kept"));
        let conn = backend.open().await.unwrap();
        assert_eq!(backend.get_current_tid(&conn).await.unwrap(), Tid::new(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_file_writes_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::file(dir.path().join("store.cbor"));
        let backend = Arc::new(InMemoryBackend::open_file(&config).unwrap());

        let records: Vec<ObjectRecord> = (0..16)
            .map(|i| folder(&format!("f{i}")).into_record(Tid::new(1)))
            .collect();
        let writers = records.iter().cloned().map(|record| {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.put_record(record).await })
        });
        for result in futures::future::join_all(writers).await {
            result.unwrap().unwrap();
        }
        assert_eq!(backend.object_count(), 17);

        let reopened = InMemoryBackend::open_file(&config).unwrap();
        assert_eq!(reopened.object_count(), 17);
        for record in &records {
            assert_eq!(reopened.record(record.oid).as_ref(), Some(record));
        }
    }

    #[test]
    fn file_backend_requires_path() {
        let result = InMemoryBackend::open_file(&BackendConfig::new("file"));
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }
}
