//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores and
//! building object trees in them.

use arbordb_core::{ChangeSink, Database, EngineConfig, ExecutionContext};
use arbordb_storage::{BackendConfig, InMemoryBackend, ObjectWrite, Oid, StorageBackend};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A test store with automatic cleanup.
///
/// Keeps a typed handle on the backend so tests can look at published
/// state (and damage it) without going through a transaction.
pub struct TestStore {
    /// The database instance.
    pub db: Database,
    /// The backend behind `db`.
    pub backend: Arc<InMemoryBackend>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates an in-memory store with default settings.
    pub fn memory() -> Self {
        Self::with_config(&BackendConfig::memory(), EngineConfig::default())
    }

    /// Creates an in-memory store with explicit settings.
    pub fn with_config(backend: &BackendConfig, engine: EngineConfig) -> Self {
        let backend = Arc::new(InMemoryBackend::with_config(backend));
        Self::from_backend(backend, engine, None)
    }

    /// Creates a store persisted to a snapshot file in a temp directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = BackendConfig::file(temp_dir.path().join("store.cbor"));
        let backend =
            Arc::new(InMemoryBackend::open_file(&config).expect("Failed to open snapshot file"));
        Self::from_backend(backend, EngineConfig::default(), Some(temp_dir))
    }

    fn from_backend(
        backend: Arc<InMemoryBackend>,
        engine: EngineConfig,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let db = Database::from_backend(Arc::clone(&backend) as Arc<dyn StorageBackend>, engine);
        Self {
            db,
            backend,
            _temp_dir: temp_dir,
        }
    }

    /// Installs a change sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.db = self.db.with_sink(sink);
        self
    }

    /// Returns the snapshot path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|d| d.path().join("store.cbor"))
    }

    /// Number of checked-out connections.
    pub fn connections_in_use(&self) -> usize {
        self.backend.pool().in_use()
    }

    /// Creates a folder under `parent` in its own transaction.
    pub async fn add_folder(&self, parent: Oid, name: &str) -> Oid {
        let oid = Oid::new();
        let ctx = ExecutionContext::new();
        self.db
            .manager()
            .run(&ctx, |txn| {
                let write = folder_at(oid, parent, name);
                async move { txn.add(write) }
            })
            .await
            .expect("Failed to add folder");
        oid
    }

    /// Creates a chain of `depth` nested folders under the root in one
    /// transaction, outermost first.
    pub async fn add_chain(&self, depth: usize) -> Vec<Oid> {
        let oids: Vec<Oid> = (0..depth).map(|_| Oid::new()).collect();
        let ctx = ExecutionContext::new();
        self.db
            .manager()
            .run(&ctx, |txn| {
                let mut parent = Oid::ROOT;
                let mut writes = Vec::with_capacity(oids.len());
                for (level, oid) in oids.iter().enumerate() {
                    writes.push(folder_at(*oid, parent, &format!("level-{level}")));
                    parent = *oid;
                }
                async move {
                    for write in writes {
                        txn.add(write)?;
                    }
                    Ok(())
                }
            })
            .await
            .expect("Failed to add chain");
        oids
    }

    /// Rewrites the parent of a published resource, bypassing transactions.
    pub async fn set_parent(&self, oid: Oid, parent: Option<Oid>) {
        let mut record = self.backend.record(oid).expect("Object is not published");
        record.parent_oid = parent;
        self.backend
            .put_record(record)
            .await
            .expect("Failed to rewrite record");
    }

    /// Published children of `parent` as name to state.
    pub async fn children(&self, parent: Oid) -> BTreeMap<String, Bytes> {
        let ctx = ExecutionContext::new();
        let manager = self.db.manager();
        let txn = manager.begin(&ctx).await.expect("Failed to begin");
        let items = txn.items(parent).await.expect("Failed to list children");
        manager.abort(&ctx).await;
        items
            .into_iter()
            .filter_map(|record| record.name.clone().map(|name| (name, record.state)))
            .collect()
    }
}

impl std::ops::Deref for TestStore {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// A `Folder` resource with a fresh oid.
pub fn folder(parent: Oid, name: &str) -> ObjectWrite {
    folder_at(Oid::new(), parent, name)
}

/// A `Folder` resource with the given oid.
pub fn folder_at(oid: Oid, parent: Oid, name: &str) -> ObjectWrite {
    ObjectWrite::resource(oid, parent, name, "Folder", Bytes::from_static(b"{}"))
}

/// Runs a future on a fresh single-threaded runtime.
///
/// For proptest bodies, which cannot be async.
pub fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
        .block_on(future)
}
