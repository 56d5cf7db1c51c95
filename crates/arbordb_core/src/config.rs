//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default size of a blob chunk (1 MiB).
pub const DEFAULT_BLOB_CHUNK_SIZE: usize = 1024 * 1024;

/// Configuration of the transaction engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of every blob chunk but the last.
    pub blob_chunk_size: usize,

    /// How many times [`TransactionManager::run`] retries on conflict.
    ///
    /// [`TransactionManager::run`]: crate::TransactionManager::run
    pub conflict_retries: u32,

    /// Vacuum settings.
    pub vacuum: VacuumOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blob_chunk_size: DEFAULT_BLOB_CHUNK_SIZE,
            conflict_retries: 3,
            vacuum: VacuumOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the blob chunk size.
    #[must_use]
    pub const fn blob_chunk_size(mut self, size: usize) -> Self {
        self.blob_chunk_size = size;
        self
    }

    /// Sets the number of conflict retries.
    #[must_use]
    pub const fn conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Sets the vacuum options.
    #[must_use]
    pub const fn vacuum(mut self, options: VacuumOptions) -> Self {
        self.vacuum = options;
        self
    }
}

/// Settings for a vacuum run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumOptions {
    /// Classify and count without deleting.
    pub dry_run: bool,

    /// Rows fetched per metadata page.
    pub page_size: usize,

    /// Connections used by the gather phase.
    pub connections: usize,

    /// Removable oids deleted per backend call.
    pub batch_size: usize,
}

impl Default for VacuumOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            page_size: 1000,
            connections: 5,
            batch_size: 100,
        }
    }
}

impl VacuumOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets dry-run mode.
    #[must_use]
    pub const fn dry_run(mut self, value: bool) -> Self {
        self.dry_run = value;
        self
    }

    /// Sets the gather page size.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the number of gather connections.
    #[must_use]
    pub const fn connections(mut self, count: usize) -> Self {
        self.connections = count;
        self
    }

    /// Sets the delete batch size.
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }
}
