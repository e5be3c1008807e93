//! Client configuration.
//!
//! [`ClientConfig`] carries the per-request deadlines and protocol switches of
//! a [`LedgerClient`](crate::LedgerClient). It is built through a validating
//! builder or deserialized from a config file with human-readable durations.

use std::time::Duration;

use quorumlog_cluster::ConfigError;
use serde::{Deserialize, Serialize};

/// Default deadline of one add request to one bookie.
pub const DEFAULT_ADD_ENTRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline of one read request to one bookie.
pub const DEFAULT_READ_ENTRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of ordered completion workers.
pub const DEFAULT_NUM_WORKERS: usize = 4;

/// Default largest frame a single bookie response may carry (5 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// Default number of re-reads after a metadata version conflict.
pub const DEFAULT_METADATA_CONFLICT_RETRIES: u32 = 1;

/// Default largest number of entries one unconfirmed range read may request.
pub const DEFAULT_MAX_UNCONFIRMED_READ_ENTRIES: usize = 65_536;

/// Configuration for [`LedgerClient`](crate::LedgerClient).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use quorumlog_client::ClientConfig;
///
/// let config = ClientConfig::builder()
///     .add_entry_timeout(Duration::from_secs(2))
///     .parallel_reads(true)
///     .build()?;
/// assert!(config.parallel_reads());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Deadline of one add request to one bookie.
    #[serde(with = "humantime_serde", default = "default_add_entry_timeout")]
    pub(crate) add_entry_timeout: Duration,

    /// Deadline of one read request to one bookie.
    #[serde(with = "humantime_serde", default = "default_read_entry_timeout")]
    pub(crate) read_entry_timeout: Duration,

    /// Replace failed bookies during writes instead of failing the add.
    #[serde(default = "default_true")]
    pub(crate) ensemble_change_enabled: bool,

    /// Query every candidate bookie at once instead of one after another.
    #[serde(default)]
    pub(crate) parallel_reads: bool,

    /// Accept a ledger opened with the wrong digest kind, using the stored one.
    #[serde(default)]
    pub(crate) digest_autodetection: bool,

    /// Number of ordered completion workers.
    #[serde(default = "default_num_workers")]
    pub(crate) num_workers: usize,

    /// Largest frame a single bookie response may carry.
    #[serde(default = "default_max_frame_size")]
    pub(crate) max_frame_size: usize,

    /// Re-reads attempted after a metadata version conflict.
    #[serde(default = "default_metadata_conflict_retries")]
    pub(crate) metadata_conflict_retries: u32,

    /// Largest number of entries one unconfirmed range read may request.
    #[serde(default = "default_max_unconfirmed_read_entries")]
    pub(crate) max_unconfirmed_read_entries: usize,
}

fn default_add_entry_timeout() -> Duration {
    DEFAULT_ADD_ENTRY_TIMEOUT
}

fn default_read_entry_timeout() -> Duration {
    DEFAULT_READ_ENTRY_TIMEOUT
}

fn default_true() -> bool {
    true
}

fn default_num_workers() -> usize {
    DEFAULT_NUM_WORKERS
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_metadata_conflict_retries() -> u32 {
    DEFAULT_METADATA_CONFLICT_RETRIES
}

fn default_max_unconfirmed_read_entries() -> usize {
    DEFAULT_MAX_UNCONFIRMED_READ_ENTRIES
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            add_entry_timeout: DEFAULT_ADD_ENTRY_TIMEOUT,
            read_entry_timeout: DEFAULT_READ_ENTRY_TIMEOUT,
            ensemble_change_enabled: true,
            parallel_reads: false,
            digest_autodetection: false,
            num_workers: DEFAULT_NUM_WORKERS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            metadata_conflict_retries: DEFAULT_METADATA_CONFLICT_RETRIES,
            max_unconfirmed_read_entries: DEFAULT_MAX_UNCONFIRMED_READ_ENTRIES,
        }
    }
}

#[bon::bon]
impl ClientConfig {
    /// Creates a new configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - either timeout is zero
    /// - `num_workers` is zero
    /// - `max_frame_size` or `max_unconfirmed_read_entries` is zero
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_ADD_ENTRY_TIMEOUT)] add_entry_timeout: Duration,
        #[builder(default = DEFAULT_READ_ENTRY_TIMEOUT)] read_entry_timeout: Duration,
        #[builder(default = true)] ensemble_change_enabled: bool,
        #[builder(default)] parallel_reads: bool,
        #[builder(default)] digest_autodetection: bool,
        #[builder(default = DEFAULT_NUM_WORKERS)] num_workers: usize,
        #[builder(default = DEFAULT_MAX_FRAME_SIZE)] max_frame_size: usize,
        #[builder(default = DEFAULT_METADATA_CONFLICT_RETRIES)] metadata_conflict_retries: u32,
        #[builder(default = DEFAULT_MAX_UNCONFIRMED_READ_ENTRIES)] max_unconfirmed_read_entries: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            add_entry_timeout,
            read_entry_timeout,
            ensemble_change_enabled,
            parallel_reads,
            digest_autodetection,
            num_workers,
            max_frame_size,
            metadata_conflict_retries,
            max_unconfirmed_read_entries,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// Deserialized configurations bypass the builder; call this before use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.add_entry_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "add_entry_timeout",
                value: "0s".into(),
            });
        }
        if self.read_entry_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "read_entry_timeout",
                value: "0s".into(),
            });
        }
        if self.num_workers == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "num_workers",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_frame_size",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.max_unconfirmed_read_entries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_unconfirmed_read_entries",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Returns the add deadline.
    #[must_use]
    pub fn add_entry_timeout(&self) -> Duration {
        self.add_entry_timeout
    }

    /// Returns the read deadline.
    #[must_use]
    pub fn read_entry_timeout(&self) -> Duration {
        self.read_entry_timeout
    }

    /// Returns whether failed bookies are replaced during writes.
    #[must_use]
    pub fn ensemble_change_enabled(&self) -> bool {
        self.ensemble_change_enabled
    }

    /// Returns whether reads query all candidates at once.
    #[must_use]
    pub fn parallel_reads(&self) -> bool {
        self.parallel_reads
    }

    /// Returns whether a mismatched digest kind is tolerated on open.
    #[must_use]
    pub fn digest_autodetection(&self) -> bool {
        self.digest_autodetection
    }

    /// Returns the number of completion workers.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Returns the largest frame size.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Returns the number of re-reads after a metadata version conflict.
    #[must_use]
    pub fn metadata_conflict_retries(&self) -> u32 {
        self.metadata_conflict_retries
    }

    /// Returns the entry cap of one unconfirmed range read.
    #[must_use]
    pub fn max_unconfirmed_read_entries(&self) -> usize {
        self.max_unconfirmed_read_entries
    }
}
