//! # ArborDB Core
//!
//! Transaction engine for ArborDB.
//!
//! This crate provides:
//! - Optimistic transactions with two-phase publication over any
//!   [`StorageBackend`](arbordb_storage::StorageBackend)
//! - A transaction manager that binds transactions to execution contexts
//!   and finishes them even when the caller is cancelled
//! - Chunked blob transfer
//! - Change notification for search indexing
//! - Reachability-based garbage collection (vacuum)
//!
//! ```rust
//! use arbordb_core::{Database, EngineConfig, ExecutionContext};
//! use arbordb_storage::{BackendConfig, ObjectWrite, Oid};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! runtime.block_on(async {
//!     let db = Database::open(&BackendConfig::memory(), EngineConfig::default())?;
//!     let ctx = ExecutionContext::with_principal("editor");
//!
//!     let txn = db.manager().begin(&ctx).await?;
//!     let folder = Oid::new();
//!     txn.add(ObjectWrite::resource(folder, Oid::ROOT, "news", "Folder", &b"{}"[..]))?;
//!     let tid = db.manager().commit(&ctx).await?;
//!     assert!(tid.is_some());
//!     Ok::<_, arbordb_core::CoreError>(())
//! })?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod config;
mod context;
mod database;
mod error;
mod notify;
mod shield;
mod stats;
mod transaction;
mod types;
mod vacuum;

pub use blob::{Blob, BlobWriter, BLOB_ANNOTATION_TYPE};
pub use config::{EngineConfig, VacuumOptions, DEFAULT_BLOB_CHUNK_SIZE};
pub use context::ExecutionContext;
pub use database::{Database, DatabaseInfo};
pub use error::{CoreError, CoreResult};
pub use notify::{ChangeSet, ChangeSink, IndexFields, SinkError};
pub use stats::{StatsSnapshot, TransactionStats};
pub use transaction::{PendingOp, PendingWrite, Transaction, TransactionManager, TransactionState};
pub use types::{ContextId, TxnId};
pub use vacuum::{classify, MetadataIndex, Vacuum, VacuumReport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
