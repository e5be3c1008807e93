//! Shared test utilities for code built on the cluster contracts.
//!
//! Feature-gated behind `testutil` to keep it out of production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! quorumlog-cluster = { path = "../cluster", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use quorumlog_cluster::testutil::{bookie_ids, make_payload, single_ensemble_metadata};
//! ```

use std::collections::BTreeMap;

use crate::{
    error::{BookieError, BookieResult},
    metadata::LedgerMetadata,
    types::{BookieId, QuorumSizes},
};

/// Ids `bookie-0 .. bookie-{count-1}`, matching
/// [`MemoryBookieCluster::with_bookies`](crate::MemoryBookieCluster::with_bookies).
#[must_use]
pub fn bookie_ids(count: usize) -> Vec<BookieId> {
    (0..count).map(|i| BookieId::new(format!("bookie-{i}"))).collect()
}

/// A payload of `size` bytes filled with `0xAB`.
#[must_use]
pub fn make_payload(size: usize) -> Vec<u8> {
    vec![0xAB; size]
}

/// A payload tagged with its entry index, e.g. `"entry-000042"`.
#[must_use]
pub fn make_tagged_payload(idx: usize) -> Vec<u8> {
    format!("entry-{idx:06}").into_bytes()
}

/// Open metadata for a ledger served by one ensemble from entry 0.
///
/// # Panics
///
/// Panics if the quorum sizes are invalid or do not match the ensemble.
#[must_use]
pub fn single_ensemble_metadata(
    ensemble: Vec<BookieId>,
    write_quorum: usize,
    ack_quorum: usize,
) -> LedgerMetadata {
    let quorum =
        QuorumSizes::new(ensemble.len(), write_quorum, ack_quorum).expect("valid quorum sizes");
    LedgerMetadata::builder().quorum(quorum).ensembles(BTreeMap::from([(0, ensemble)])).build()
}

/// Assert that a [`BookieResult`] failed with [`BookieError::Unavailable`].
#[macro_export]
macro_rules! assert_bookie_unavailable {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::BookieError::Unavailable { .. })),
            "expected BookieError::Unavailable, got: {:?}",
            $result,
        );
    };
}

/// Returns `true` if the result failed because data was missing.
pub fn is_missing<T>(result: &BookieResult<T>) -> bool {
    matches!(result, Err(err) if err.is_missing_data())
}

/// Returns `true` if the result failed with [`BookieError::Fenced`].
pub fn is_fenced<T>(result: &BookieResult<T>) -> bool {
    matches!(result, Err(BookieError::Fenced { .. }))
}
