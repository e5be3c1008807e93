//! Error taxonomy of the ledger client.
//!
//! Parameter validation errors ([`LedgerError::InvalidArgument`],
//! [`LedgerError::IndexOutOfBounds`], [`LedgerError::IncorrectParameter`])
//! are raised before any bookie is contacted. Everything else is the outcome
//! of quorum arithmetic over bookie responses, or of a metadata-store call.

use std::sync::Arc;

use quorumlog_cluster::{BoxError, ConfigError, LedgerId, MetadataError, PlacementError};
use thiserror::Error;

/// Result type alias for ledger client operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Errors returned by the ledger client.
///
/// Cloneable so a single failure can be delivered to every waiter of a
/// shared operation, such as concurrent [`close`](crate::LedgerHandle::close)
/// calls.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// A required argument was missing or malformed.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// `offset + length` does not fit in the supplied buffer.
    #[error("Range [{offset}, {offset}+{length}) out of bounds for buffer of {size} bytes")]
    IndexOutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        length: usize,
        /// Size of the buffer.
        size: usize,
    },

    /// A semantically invalid range or count.
    #[error("Incorrect parameter: {message}")]
    IncorrectParameter {
        /// What was wrong.
        message: String,
    },

    /// An ensemble could not be formed, or the ack quorum became unreachable.
    #[error("Not enough bookies for ledger {ledger_id}: {message}")]
    NotEnoughBookies {
        /// Affected ledger, `-1` before an id is allocated.
        ledger_id: LedgerId,
        /// What could not be satisfied.
        message: String,
    },

    /// A quorum read failed, or the range exceeds confirmed data.
    #[error("Read failed on ledger {ledger_id}: {message}")]
    Read {
        /// Ledger being read.
        ledger_id: LedgerId,
        /// What failed.
        message: String,
    },

    /// Every bookie contacted by a read was unreachable.
    #[error("No bookie available to serve ledger {ledger_id}")]
    BookieUnavailable {
        /// Ledger being read.
        ledger_id: LedgerId,
    },

    /// The requested entry does not exist.
    #[error("No such entry {entry_id} in ledger {ledger_id}")]
    NoSuchEntry {
        /// Ledger being read.
        ledger_id: LedgerId,
        /// Missing entry.
        entry_id: i64,
    },

    /// A response failed digest verification.
    #[error("Digest mismatch on ledger {ledger_id} entry {entry_id}")]
    DigestMismatch {
        /// Ledger being read.
        ledger_id: LedgerId,
        /// Entry whose digest did not verify.
        entry_id: i64,
    },

    /// Password or digest kind does not match the ledger.
    #[error("Unauthorized access to ledger {ledger_id}")]
    UnauthorizedAccess {
        /// Ledger being opened.
        ledger_id: LedgerId,
    },

    /// A ledger with this id already exists.
    #[error("Ledger {ledger_id} already exists")]
    LedgerExists {
        /// Conflicting id.
        ledger_id: LedgerId,
    },

    /// No ledger with this id exists.
    #[error("Ledger {ledger_id} not found")]
    LedgerNotFound {
        /// Missing id.
        ledger_id: LedgerId,
    },

    /// The handle is closed, or the ledger is sealed and cannot take adds.
    #[error("Ledger {ledger_id} is closed")]
    LedgerClosed {
        /// Affected ledger.
        ledger_id: LedgerId,
    },

    /// Another client fenced the ledger for recovery.
    #[error("Ledger {ledger_id} was fenced by another client")]
    LedgerFenced {
        /// Affected ledger.
        ledger_id: LedgerId,
    },

    /// Metadata changed underneath this client in an incompatible way.
    #[error("Metadata version conflict on ledger {ledger_id}")]
    MetadataVersion {
        /// Affected ledger.
        ledger_id: LedgerId,
    },

    /// A completion callback panicked.
    #[error("Unexpected condition: {message}")]
    UnexpectedCondition {
        /// Panic payload or description.
        message: String,
    },

    /// The client has been closed.
    #[error("Client is closed")]
    ClientClosed,

    /// Any other collaborator failure.
    #[error("Cluster error: {message}")]
    Cluster {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl LedgerError {
    /// Creates an `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Creates an `IncorrectParameter` error.
    #[must_use]
    pub fn incorrect_parameter(message: impl Into<String>) -> Self {
        Self::IncorrectParameter { message: message.into() }
    }

    /// Creates a `NotEnoughBookies` error.
    #[must_use]
    pub fn not_enough_bookies(ledger_id: LedgerId, message: impl Into<String>) -> Self {
        Self::NotEnoughBookies { ledger_id, message: message.into() }
    }

    /// Creates a `Read` error.
    #[must_use]
    pub fn read(ledger_id: LedgerId, message: impl Into<String>) -> Self {
        Self::Read { ledger_id, message: message.into() }
    }

    /// Creates an `UnexpectedCondition` error.
    #[must_use]
    pub fn unexpected_condition(message: impl Into<String>) -> Self {
        Self::UnexpectedCondition { message: message.into() }
    }

    /// Creates a `Cluster` error with a message and source error.
    #[must_use]
    pub fn cluster_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cluster { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Stable numeric code, compatible with the classic bookkeeper return codes.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Read { .. } => -1,
            Self::NoSuchEntry { .. } => -13,
            Self::InvalidArgument { .. } | Self::IndexOutOfBounds { .. } => -4,
            Self::IncorrectParameter { .. } => -14,
            Self::DigestMismatch { .. } => -5,
            Self::NotEnoughBookies { .. } => -6,
            Self::BookieUnavailable { .. } => -8,
            Self::LedgerExists { .. } => -20,
            Self::LedgerNotFound { .. } => -7,
            Self::LedgerClosed { .. } => -11,
            Self::LedgerFenced { .. } => -101,
            Self::UnauthorizedAccess { .. } => -102,
            Self::MetadataVersion { .. } => -17,
            Self::UnexpectedCondition { .. } => -999,
            Self::ClientClosed => -19,
            Self::Cluster { .. } => -3,
        }
    }

    /// Maps a metadata-store error for the given ledger.
    pub(crate) fn from_metadata(ledger_id: LedgerId, err: MetadataError) -> Self {
        match err {
            MetadataError::LedgerExists { ledger_id } => Self::LedgerExists { ledger_id },
            MetadataError::NoSuchLedger { ledger_id } => Self::LedgerNotFound { ledger_id },
            MetadataError::BadVersion { .. } => Self::MetadataVersion { ledger_id },
            other => Self::cluster_with_source(format!("metadata store failed for ledger {ledger_id}"), other),
        }
    }

    /// Maps a placement error for the given ledger.
    pub(crate) fn from_placement(ledger_id: LedgerId, err: PlacementError) -> Self {
        Self::not_enough_bookies(ledger_id, err.to_string())
    }
}

impl From<ConfigError> for LedgerError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidArgument { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_metadata_mapping() {
        let id = LedgerId::from(4);
        assert!(matches!(
            LedgerError::from_metadata(id, MetadataError::LedgerExists { ledger_id: id }),
            LedgerError::LedgerExists { .. }
        ));
        assert!(matches!(
            LedgerError::from_metadata(id, MetadataError::NoSuchLedger { ledger_id: id }),
            LedgerError::LedgerNotFound { .. }
        ));
        assert!(matches!(
            LedgerError::from_metadata(
                id,
                MetadataError::BadVersion { ledger_id: id, expected: 1, actual: 2 }
            ),
            LedgerError::MetadataVersion { .. }
        ));
    }

    #[test]
    fn test_internal_metadata_error_keeps_source() {
        let err = LedgerError::from_metadata(LedgerId::from(1), MetadataError::internal("zk down"));
        assert!(matches!(err, LedgerError::Cluster { .. }));
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("Metadata store error: zk down"));
    }

    #[test]
    fn test_config_error_is_invalid_argument() {
        let err: LedgerError = ConfigError::Exceeds {
            field: "ack_quorum",
            value: "3".into(),
            limit_field: "write_quorum",
            limit: "2".into(),
        }
        .into();
        assert!(matches!(err, LedgerError::InvalidArgument { .. }));
        assert_eq!(err.code(), -4);
    }

    #[test]
    fn test_error_display() {
        let err = LedgerError::IndexOutOfBounds { offset: 4, length: 8, size: 10 };
        assert_eq!(err.to_string(), "Range [4, 4+8) out of bounds for buffer of 10 bytes");

        let err = LedgerError::LedgerClosed { ledger_id: LedgerId::from(3) };
        assert_eq!(err.to_string(), "Ledger 3 is closed");
    }
}
