//! Database facade.

use crate::config::{EngineConfig, VacuumOptions};
use crate::error::CoreResult;
use crate::notify::ChangeSink;
use crate::stats::StatsSnapshot;
use crate::transaction::TransactionManager;
use crate::vacuum::{Vacuum, VacuumReport};
use arbordb_storage::{BackendConfig, BackendRegistry, StorageBackend, StorageError, Tid};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// The main database handle.
///
/// `Database` ties a storage backend to a [`TransactionManager`] and exposes
/// maintenance operations such as [`vacuum`](Database::vacuum).
///
/// # Opening a Database
///
/// The backend is chosen by name from a [`BackendRegistry`]:
///
/// ```rust,ignore
/// use arbordb_core::{Database, EngineConfig, ExecutionContext};
/// use arbordb_storage::BackendConfig;
///
/// let db = Database::open(&BackendConfig::file("site.cbor"), EngineConfig::default())?;
///
/// let ctx = ExecutionContext::with_principal("editor");
/// let txn = db.manager().begin(&ctx).await?;
/// // ...
/// db.manager().commit(&ctx).await?;
///
/// db.close().await;
/// ```
pub struct Database {
    backend: Arc<dyn StorageBackend>,
    manager: TransactionManager,
}

impl Database {
    /// Opens a database using the built-in backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend name is unknown or the backend
    /// cannot be built from `config`.
    pub fn open(config: &BackendConfig, engine: EngineConfig) -> CoreResult<Self> {
        Self::open_with_registry(&BackendRegistry::with_defaults(), config, engine)
    }

    /// Opens a database using backends from `registry`.
    ///
    /// # Errors
    ///
    /// See [`open`](Database::open).
    pub fn open_with_registry(
        registry: &BackendRegistry,
        config: &BackendConfig,
        engine: EngineConfig,
    ) -> CoreResult<Self> {
        let backend = registry.build(config)?;
        info!(backend = backend.name(), pool_size = backend.pool().size(), "database opened");
        Ok(Self::from_backend(backend, engine))
    }

    /// Wraps an already constructed backend.
    pub fn from_backend(backend: Arc<dyn StorageBackend>, engine: EngineConfig) -> Self {
        let manager = TransactionManager::new(Arc::clone(&backend), engine);
        Self { backend, manager }
    }

    /// Installs a change sink on the manager.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.manager = self.manager.with_sink(sink);
        self
    }

    /// Returns the transaction manager.
    #[must_use]
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Returns the storage backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.manager.config()
    }

    /// Runs a vacuum with the configured options.
    pub async fn vacuum(&self) -> CoreResult<VacuumReport> {
        self.vacuum_with(self.config().vacuum).await
    }

    /// Runs a vacuum with explicit options.
    pub async fn vacuum_with(&self, options: VacuumOptions) -> CoreResult<VacuumReport> {
        Vacuum::new(Arc::clone(&self.backend), options).run().await
    }

    /// Collects counters describing the store, with a resource count for
    /// each name in `types`.
    pub async fn inspect(&self, types: &[String]) -> CoreResult<DatabaseInfo> {
        let conn = self.backend.open().await?;
        let counts = async {
            let objects = self.backend.get_total_number_of_objects(&conn).await?;
            let resources = self.backend.get_total_number_of_resources(&conn).await?;
            let current_tid = self.backend.get_current_tid(&conn).await?;
            let mut per_type = BTreeMap::new();
            for type_name in types {
                let count = self.backend.get_total_resources_of_type(&conn, type_name).await?;
                per_type.insert(type_name.clone(), count);
            }
            Ok::<_, StorageError>((objects, resources, current_tid, per_type))
        }
        .await;
        self.backend.close(conn).await?;
        let (objects, resources, current_tid, types) = counts?;

        Ok(DatabaseInfo {
            backend: self.backend.name().to_string(),
            pool_size: self.backend.pool().size(),
            objects,
            resources,
            types,
            current_tid,
            transactions: self.manager.stats().snapshot(),
        })
    }

    /// Closes the connection pool.
    ///
    /// Waiting `open` calls fail; connections already handed out stay
    /// usable until released.
    pub async fn close(&self) {
        self.backend.pool().close();
        info!(backend = self.backend.name(), "database closed");
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend.name())
            .field("manager", &self.manager)
            .finish()
    }
}

/// Point-in-time description of a database.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    /// Backend name.
    pub backend: String,
    /// Connection pool size.
    pub pool_size: usize,
    /// Number of stored objects, root included.
    pub objects: u64,
    /// Number of stored resources.
    pub resources: u64,
    /// Resource counts for the requested type names.
    pub types: BTreeMap<String, u64>,
    /// Latest committed tid.
    pub current_tid: Tid,
    /// Transaction counters since open.
    pub transactions: StatsSnapshot,
}
