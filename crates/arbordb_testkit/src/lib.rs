//! # ArborDB Testkit
//!
//! Test utilities for ArborDB.
//!
//! This crate provides:
//! - Test stores with automatic cleanup and tree-building helpers
//! - A change sink that records what it receives
//! - Property-based test generators using proptest
//! - Concurrent writer stress helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use arbordb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_store() {
//!     let store = TestStore::memory();
//!     let folder = store.add_folder(Oid::ROOT, "news").await;
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod sink;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::sink::*;
    pub use crate::stress::*;
    pub use arbordb_storage::Oid;
}

pub use fixtures::*;
pub use generators::*;
pub use sink::*;
pub use stress::*;
