//! Transactions and their manager.
//!
//! ArborDB uses optimistic concurrency control:
//! - **Staging**: writes stay in the transaction until commit
//! - **Validation**: at commit, everything committed since the transaction
//!   began is checked against its read and write sets
//! - **Publication**: the backend makes all writes visible at once under a
//!   fresh tid, or none of them

mod manager;
mod state;
mod txn;

pub use manager::TransactionManager;
pub use state::{PendingOp, PendingWrite, TransactionState};
pub use txn::Transaction;
