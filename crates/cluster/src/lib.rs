//! Collaborator contracts of the quorumlog ledger client.
//!
//! A ledger client replicates entries across storage nodes ("bookies"). It
//! does not own the transport to those nodes, the policy that chooses them,
//! or the store that persists ledger metadata. This crate defines those
//! three seams as traits, together with the types that cross them, and ships
//! in-memory implementations of each.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   quorumlog-client                          │
//! │   LedgerClient │ LedgerHandle │ pending ops │ digests       │
//! ├───────────────────┬────────────────────┬────────────────────┤
//! │   BookieClient    │ EnsemblePlacement- │ LedgerMetadata-    │
//! │                   │ Policy             │ Store              │
//! ├───────────────────┼────────────────────┼────────────────────┤
//! │ MemoryBookie-     │ RandomPlacement-   │ MemoryMetadata-    │
//! │ Cluster (testing) │ Policy             │ Store (testing)    │
//! └───────────────────┴────────────────────┴────────────────────┘
//! ```
//!
//! # Error Handling
//!
//! Each contract has its own error family: [`BookieError`],
//! [`PlacementError`] and [`MetadataError`]. The client maps them onto its
//! own taxonomy.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers (bookie ids, payload
//!   generators, metadata factories, assertion macros).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bookie;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod placement;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

pub use bookie::{BookieClient, NodeOutcome, ReadFlags, WriteFlags};
pub use error::{
    BookieError, BookieResult, BoxError, ConfigError, MetadataError, MetadataResult,
    PlacementError,
};
pub use memory::{MemoryBookieCluster, MemoryMetadataStore};
pub use metadata::{LedgerMetadata, LedgerMetadataStore, LedgerState, Versioned};
pub use metrics::{ClientStats, ClientStatsSnapshot};
pub use placement::{EnsemblePlacementPolicy, RandomPlacementPolicy};
pub use types::{BookieId, DigestType, LedgerId, QuorumSizes, INVALID_ENTRY_ID};
