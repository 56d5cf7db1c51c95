//! Backend selection by name.

use crate::backend::StorageBackend;
use crate::config::BackendConfig;
use crate::error::{StorageError, StorageResult};
use crate::memory::InMemoryBackend;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Builds a backend from its configuration.
pub type BackendFactory = fn(&BackendConfig) -> StorageResult<Arc<dyn StorageBackend>>;

/// Maps backend names to factories.
///
/// The configured name is resolved once, when the engine starts; an unknown
/// name is a startup error rather than a failure on first use.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// A registry without any backend.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the built-in `memory` and `file` backends.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", |config| {
            Ok(Arc::new(InMemoryBackend::with_config(config)) as Arc<dyn StorageBackend>)
        });
        registry.register("file", |config| {
            Ok(Arc::new(InMemoryBackend::open_file(config)?) as Arc<dyn StorageBackend>)
        });
        registry
    }

    /// Registers (or replaces) a backend.
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds the backend named by `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownBackend`] for an unregistered name,
    /// [`StorageError::InvalidConfig`] for a zero-sized pool, and whatever
    /// the factory fails with.
    pub fn build(&self, config: &BackendConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| StorageError::UnknownBackend(config.backend.clone()))?;

        if config.pool_size == 0 {
            return Err(StorageError::InvalidConfig(
                "pool_size must be at least 1".into(),
            ));
        }

        let backend = factory(config)?;
        info!(backend = %config.backend, pool_size = config.pool_size, "storage backend ready");
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
