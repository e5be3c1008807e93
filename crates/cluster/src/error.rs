//! Error types raised by the collaborators of the ledger client.
//!
//! Three families live here, one per external contract:
//!
//! - [`BookieError`] - a single bookie failed to serve a request
//! - [`PlacementError`] - the placement policy could not form or repair an ensemble
//! - [`MetadataError`] - the ledger-metadata store rejected a request
//!
//! plus [`ConfigError`], shared by every validating builder in the workspace.
//!
//! # Example
//!
//! ```
//! use quorumlog_cluster::{BookieError, BookieId, BookieResult};
//!
//! fn probe(bookie: &BookieId) -> BookieResult<()> {
//!     Err(BookieError::unavailable(bookie.clone()))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::types::{BookieId, LedgerId};

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for bookie requests.
pub type BookieResult<T> = Result<T, BookieError>;

/// Result type alias for metadata-store requests.
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Errors returned by a single bookie.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BookieError {
    /// The bookie could not be reached.
    #[error("Bookie {bookie} unavailable")]
    Unavailable {
        /// The unreachable bookie.
        bookie: BookieId,
    },

    /// The bookie holds no data for the ledger.
    #[error("No such ledger {ledger_id}")]
    NoSuchLedger {
        /// Ledger that was requested.
        ledger_id: LedgerId,
    },

    /// The bookie holds the ledger but not the requested entry.
    #[error("No such entry {entry_id} in ledger {ledger_id}")]
    NoSuchEntry {
        /// Ledger that was requested.
        ledger_id: LedgerId,
        /// Entry that was requested.
        entry_id: i64,
    },

    /// The ledger was fenced by a recovering reader; regular adds are refused.
    #[error("Ledger {ledger_id} is fenced")]
    Fenced {
        /// The fenced ledger.
        ledger_id: LedgerId,
    },

    /// The master key presented with the request does not match the ledger.
    #[error("Unauthorized access to ledger {ledger_id}")]
    Unauthorized {
        /// Ledger that was requested.
        ledger_id: LedgerId,
    },

    /// The request did not complete within its deadline.
    #[error("Bookie request timed out")]
    Timeout,

    /// Any other bookie-side failure.
    #[error("Bookie internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl BookieError {
    /// Creates an `Unavailable` error for the given bookie.
    #[must_use]
    pub fn unavailable(bookie: BookieId) -> Self {
        Self::Unavailable { bookie }
    }

    /// Creates a `NoSuchLedger` error.
    #[must_use]
    pub fn no_such_ledger(ledger_id: LedgerId) -> Self {
        Self::NoSuchLedger { ledger_id }
    }

    /// Creates a `NoSuchEntry` error.
    #[must_use]
    pub fn no_such_entry(ledger_id: LedgerId, entry_id: i64) -> Self {
        Self::NoSuchEntry { ledger_id, entry_id }
    }

    /// Creates a `Fenced` error.
    #[must_use]
    pub fn fenced(ledger_id: LedgerId) -> Self {
        Self::Fenced { ledger_id }
    }

    /// Creates an `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(ledger_id: LedgerId) -> Self {
        Self::Unauthorized { ledger_id }
    }

    /// Creates an `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates an `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` when the bookie answered and simply lacks the data.
    ///
    /// Such answers count towards read coverage, unlike transport failures.
    #[must_use]
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Self::NoSuchLedger { .. } | Self::NoSuchEntry { .. })
    }

    /// Returns `true` when the bookie could not be reached at all.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout)
    }
}

/// Errors returned by an [`EnsemblePlacementPolicy`](crate::EnsemblePlacementPolicy).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PlacementError {
    /// Not enough writable bookies outside the excluded set.
    #[error("Not enough bookies: required {required}, available {available}")]
    NotEnoughBookies {
        /// Number of bookies the request needed.
        required: usize,
        /// Number of candidate bookies that were available.
        available: usize,
    },
}

/// Errors returned by a [`LedgerMetadataStore`](crate::LedgerMetadataStore).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum MetadataError {
    /// A ledger with this id already exists.
    #[error("Ledger {ledger_id} already exists")]
    LedgerExists {
        /// The conflicting ledger id.
        ledger_id: LedgerId,
    },

    /// No metadata is stored for the ledger.
    #[error("No such ledger {ledger_id}")]
    NoSuchLedger {
        /// The missing ledger id.
        ledger_id: LedgerId,
    },

    /// The stored version differs from the expected one.
    #[error("Metadata version conflict on ledger {ledger_id}: expected {expected}, found {actual}")]
    BadVersion {
        /// Ledger whose metadata was written.
        ledger_id: LedgerId,
        /// Version the writer expected.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Any other store failure.
    #[error("Metadata store error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl MetadataError {
    /// Creates an `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Value that was supplied.
        value: String,
    },

    /// A duration or count must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was supplied.
        value: String,
    },

    /// Two fields violate an ordering constraint.
    #[error("{field} ({value}) must not exceed {limit_field} ({limit})")]
    Exceeds {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was supplied.
        value: String,
        /// Name of the bounding field.
        limit_field: &'static str,
        /// Value of the bounding field.
        limit: String,
    },
}
