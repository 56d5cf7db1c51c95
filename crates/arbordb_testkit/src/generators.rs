//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use arbordb_storage::Oid;
use proptest::prelude::*;

/// Strategy for generating oids, reserved ones excluded.
pub fn oid_strategy() -> impl Strategy<Value = Oid> {
    prop::array::uniform16(any::<u8>())
        .prop_map(Oid::from_bytes)
        .prop_filter("Reserved oids are not generated", |oid| !oid.is_reserved())
}

/// Strategy for generating valid child names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating serialized object state (arbitrary bytes).
pub fn state_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for generating blob content up to `max_len` bytes.
pub fn blob_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// One write planned for a [`WriterPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSpec {
    /// Child name under the root, unique across the whole plan.
    pub name: String,
    /// State to store.
    pub state: Vec<u8>,
}

/// Writes of one transaction.
pub type WriterPlan = Vec<WriteSpec>;

/// Strategy for generating transactions with pairwise disjoint write sets.
///
/// Names are derived from the writer and write position, so no two writes
/// anywhere in the plan touch the same child.
pub fn disjoint_writers_strategy(
    max_writers: usize,
    max_writes: usize,
) -> impl Strategy<Value = Vec<WriterPlan>> {
    prop::collection::vec(
        prop::collection::vec(state_strategy(), 1..=max_writes.max(1)),
        1..=max_writers.max(1),
    )
    .prop_map(|writers| {
        writers
            .into_iter()
            .enumerate()
            .map(|(writer, states)| {
                states
                    .into_iter()
                    .enumerate()
                    .map(|(position, state)| WriteSpec {
                        name: format!("w{writer}-{position}"),
                        state,
                    })
                    .collect()
            })
            .collect()
    })
}
