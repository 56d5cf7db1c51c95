//! # ArborDB Storage
//!
//! Storage backend contract and implementations for ArborDB.
//!
//! This crate is the lowest layer of ArborDB. Backends persist object
//! records and blob chunks, assign transaction ids and detect write
//! conflicts. They never interpret the serialized state they hold.
//!
//! ## Design Principles
//!
//! - Backends are async and must be `Send + Sync`
//! - Every call runs on a pooled [`Connection`]
//! - Staged changes become visible only when the backend publishes them
//! - The engine above owns read/write sets and change notification
//!
//! ## Available Backends
//!
//! - `memory` - [`InMemoryBackend`], for tests and ephemeral stores
//! - `file` - [`InMemoryBackend::open_file`], the same store persisted as a
//!   CBOR snapshot after every publish
//!
//! ## Example
//!
//! ```rust
//! use arbordb_storage::{BackendConfig, BackendRegistry, Oid};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = BackendRegistry::default().build(&BackendConfig::memory()).unwrap();
//! let conn = backend.open().await.unwrap();
//! assert!(backend.keys(&conn, Oid::ROOT).await.unwrap().is_empty());
//! backend.close(conn).await.unwrap();
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod error;
mod file;
mod memory;
mod pool;
mod registry;
mod types;

pub use backend::StorageBackend;
pub use config::BackendConfig;
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryBackend;
pub use pool::{Connection, ConnectionId, ConnectionPool};
pub use registry::{BackendFactory, BackendRegistry};
pub use types::{BlobChunk, BlobId, ObjectKind, ObjectMeta, ObjectRecord, ObjectWrite, Oid, Tid};
