//! Client for quorum-replicated, append-only ledgers.
//!
//! A ledger is a log of opaque entries with dense ids starting at 0, written
//! by a single writer and striped over an ensemble of bookies. Each entry is
//! stored on a write quorum of bookies and acknowledged once an ack quorum
//! has it. Readers see every entry up to the last-add-confirmed (LAC), and a
//! reader that opens a ledger still being written fences the writer and seals
//! the ledger at the last entry that might have been acknowledged.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ LedgerClient   create / open (recovery) / delete             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ LedgerHandle   add │ read │ batch read │ LAC │ close         │
//! ├──────────────┬───────────────┬───────────────────────────────┤
//! │ pending ops  │ Distribution- │ DigestManager                 │
//! │ (ops/*)      │ Schedule      │ (entry framing + verification)│
//! ├──────────────┴───────────────┴───────────────────────────────┤
//! │ OrderedExecutor: per-ledger ordered completions              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ quorumlog-cluster: BookieClient │ placement │ metadata store │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Completions
//!
//! Every operation has an awaited form (`add_entry`) and a callback form
//! (`async_add_entry`). Callbacks for one ledger run in order on that
//! ledger's worker; see [`completion`].
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module, which wires a client to the in-memory cluster.
//! - **`failpoints`**: Compiles in `fail` injection points (`add-entry-send`, `read-entry-send`,
//!   `ledger-close-before-metadata`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod completion;
pub mod config;
pub mod digest;
pub mod entry;
pub mod error;
mod executor;
pub mod handle;
mod ops;
mod recovery;
pub mod schedule;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

pub use client::{ClientContext, LedgerClient, LedgerOptions, DEFAULT_ENSEMBLE_SIZE, DEFAULT_WRITE_QUORUM};
pub use completion::{AddCallback, CallbackContext, Completion, LastConfirmedCallback, ReadCallback};
pub use config::ClientConfig;
pub use digest::{DigestError, DigestManager, VerifiedEntry};
pub use entry::LedgerEntry;
pub use error::{LedgerError, LedgerResult};
pub use handle::LedgerHandle;
pub use schedule::{AckSet, CoverageSet, DistributionSchedule};
