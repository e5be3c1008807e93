//! Identifiers and small value types shared by the client and its collaborators.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Entry id used before any entry exists, and as "nothing confirmed yet".
pub const INVALID_ENTRY_ID: i64 = -1;

/// Macro to define a newtype wrapper around `i64` with standard trait
/// implementations.
///
/// Each generated type:
/// - Is a transparent wrapper around `i64` (zero runtime cost)
/// - Derives `Copy`, `Clone`, `Debug`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Derives `Serialize` and `Deserialize` (transparent)
/// - Implements `From<i64>` and `Into<i64>`
/// - Implements `Display` that outputs the inner value
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Globally unique ledger identifier.
    ///
    /// Valid ids are non-negative. The metadata store hands them out
    /// sequentially, starting at zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use quorumlog_cluster::LedgerId;
    ///
    /// let id = LedgerId::from(42);
    /// assert_eq!(i64::from(id), 42);
    /// assert_eq!(id.to_string(), "42");
    /// ```
    LedgerId
);

impl LedgerId {
    /// Returns `true` for ids a ledger may carry.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// Address of a single storage node.
///
/// # Examples
///
/// ```
/// use quorumlog_cluster::BookieId;
///
/// let bookie = BookieId::from("10.0.0.4:3181");
/// assert_eq!(bookie.as_str(), "10.0.0.4:3181");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookieId(String);

impl BookieId {
    /// Creates a bookie id from its address.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Returns the bookie address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BookieId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for BookieId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for BookieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ensemble, write-quorum and ack-quorum sizes of a ledger.
///
/// Always satisfies `1 <= ack_quorum <= write_quorum <= ensemble_size`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawQuorumSizes")]
pub struct QuorumSizes {
    ensemble_size: usize,
    write_quorum: usize,
    ack_quorum: usize,
}

#[derive(Deserialize)]
struct RawQuorumSizes {
    ensemble_size: usize,
    write_quorum: usize,
    ack_quorum: usize,
}

impl TryFrom<RawQuorumSizes> for QuorumSizes {
    type Error = ConfigError;

    fn try_from(raw: RawQuorumSizes) -> Result<Self, Self::Error> {
        Self::new(raw.ensemble_size, raw.write_quorum, raw.ack_quorum)
    }
}

impl QuorumSizes {
    /// Validates and creates quorum sizes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any size is zero, if the write quorum
    /// exceeds the ensemble, or if the ack quorum exceeds the write quorum.
    pub fn new(
        ensemble_size: usize,
        write_quorum: usize,
        ack_quorum: usize,
    ) -> Result<Self, ConfigError> {
        for (field, value) in
            [("ensemble_size", ensemble_size), ("write_quorum", write_quorum), ("ack_quorum", ack_quorum)]
        {
            if value == 0 {
                return Err(ConfigError::BelowMinimum {
                    field,
                    min: "1".into(),
                    value: "0".into(),
                });
            }
        }
        if write_quorum > ensemble_size {
            return Err(ConfigError::Exceeds {
                field: "write_quorum",
                value: write_quorum.to_string(),
                limit_field: "ensemble_size",
                limit: ensemble_size.to_string(),
            });
        }
        if ack_quorum > write_quorum {
            return Err(ConfigError::Exceeds {
                field: "ack_quorum",
                value: ack_quorum.to_string(),
                limit_field: "write_quorum",
                limit: write_quorum.to_string(),
            });
        }
        Ok(Self { ensemble_size, write_quorum, ack_quorum })
    }

    /// Number of bookies in an ensemble.
    #[must_use]
    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    /// Number of bookies each entry is sent to.
    #[must_use]
    pub fn write_quorum(&self) -> usize {
        self.write_quorum
    }

    /// Number of acknowledgements that make an entry durable.
    #[must_use]
    pub fn ack_quorum(&self) -> usize {
        self.ack_quorum
    }

    /// Number of write-set failures an entry tolerates.
    #[must_use]
    pub fn tolerated_failures(&self) -> usize {
        self.write_quorum - self.ack_quorum
    }
}

/// Digest kind protecting every entry of a ledger.
///
/// Fixed when the ledger is created and recorded in its metadata.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestType {
    /// IEEE CRC-32.
    #[default]
    Crc32,
    /// Castagnoli CRC-32.
    Crc32c,
    /// HMAC-SHA256 keyed by the ledger password.
    Mac,
    /// No digest; entries are not checksummed.
    Dummy,
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Crc32c => write!(f, "crc32c"),
            Self::Mac => write!(f, "mac"),
            Self::Dummy => write!(f, "dummy"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_id_validity() {
        assert!(LedgerId::from(0).is_valid());
        assert!(!LedgerId::from(-1).is_valid());
    }

    #[test]
    fn test_digest_type_serde_names() {
        let json = serde_json::to_string(&DigestType::Crc32c).unwrap();
        assert_eq!(json, "\"crc32c\"");
        let parsed: DigestType = serde_json::from_str("\"mac\"").unwrap();
        assert_eq!(parsed, DigestType::Mac);
    }

    #[test]
    fn test_quorum_sizes_accept_valid_combinations() {
        for e in 1..=5 {
            for w in 1..=e {
                for a in 1..=w {
                    let sizes = QuorumSizes::new(e, w, a).unwrap();
                    assert_eq!(sizes.tolerated_failures(), w - a);
                }
            }
        }
    }

    #[test]
    fn test_quorum_sizes_reject_ack_above_write() {
        let err = QuorumSizes::new(3, 2, 3).unwrap_err();
        assert!(matches!(err, ConfigError::Exceeds { field: "ack_quorum", .. }));
    }

    #[test]
    fn test_quorum_sizes_reject_write_above_ensemble() {
        let err = QuorumSizes::new(2, 3, 1).unwrap_err();
        assert!(matches!(err, ConfigError::Exceeds { field: "write_quorum", .. }));
    }

    #[test]
    fn test_quorum_sizes_reject_zero() {
        let err = QuorumSizes::new(0, 0, 0).unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "ensemble_size", .. }));
    }

    #[test]
    fn test_quorum_sizes_deserialize_validates() {
        let ok: QuorumSizes =
            serde_json::from_str(r#"{"ensemble_size":3,"write_quorum":2,"ack_quorum":2}"#)
                .unwrap();
        assert_eq!(ok.write_quorum(), 2);
        let bad = serde_json::from_str::<QuorumSizes>(
            r#"{"ensemble_size":3,"write_quorum":2,"ack_quorum":3}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_bookie_id_ordering_follows_address() {
        let mut ids = vec![BookieId::from("bookie-2"), BookieId::from("bookie-0")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "bookie-0");
    }
}
