//! Ledger metadata and the store that persists it.
//!
//! The metadata record is the authoritative description of a ledger: its
//! quorum sizes, digest kind, password, state and the history of its
//! ensembles. A writer caches it on its handle and only ever replaces it
//! through a compare-and-set on [`Versioned::version`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::MetadataResult,
    types::{BookieId, DigestType, LedgerId, QuorumSizes, INVALID_ENTRY_ID},
};

/// Lifecycle of a ledger as recorded in its metadata.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    /// A writer may still append.
    #[default]
    Open,
    /// A reader is fencing and recovering the ledger.
    InRecovery,
    /// Sealed; `last_entry_id` and `length` are final.
    Closed,
}

/// Metadata record of one ledger.
///
/// `Debug` output redacts the password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct LedgerMetadata {
    /// Ensemble, write and ack quorum sizes.
    pub quorum: QuorumSizes,

    /// Digest kind of every entry.
    #[builder(default)]
    pub digest_type: DigestType,

    /// Password the digest and master key are derived from.
    #[builder(default)]
    pub password: Vec<u8>,

    /// Current lifecycle state.
    #[builder(default)]
    pub state: LedgerState,

    /// Last entry of a closed ledger, `-1` while open or empty.
    #[builder(default = INVALID_ENTRY_ID)]
    pub last_entry_id: i64,

    /// Payload bytes of a closed ledger.
    #[builder(default)]
    pub length: u64,

    /// Ensembles keyed by the first entry id they serve.
    pub ensembles: BTreeMap<i64, Vec<BookieId>>,

    /// Opaque application metadata.
    #[builder(default)]
    pub custom_metadata: BTreeMap<String, Vec<u8>>,

    /// Creation time, milliseconds since the Unix epoch.
    #[builder(default = chrono::Utc::now().timestamp_millis())]
    pub ctime: i64,
}

impl std::fmt::Debug for LedgerMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerMetadata")
            .field("quorum", &self.quorum)
            .field("digest_type", &self.digest_type)
            .field("password", &"[REDACTED]")
            .field("state", &self.state)
            .field("last_entry_id", &self.last_entry_id)
            .field("length", &self.length)
            .field("ensembles", &self.ensembles)
            .field("custom_metadata", &self.custom_metadata)
            .field("ctime", &self.ctime)
            .finish()
    }
}

impl LedgerMetadata {
    /// Returns `true` once the ledger has been sealed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == LedgerState::Closed
    }

    /// Returns the ensemble that serves `entry_id`.
    ///
    /// Entries below the first recorded boundary, including the
    /// `-1` placeholder, map to the first ensemble.
    #[must_use]
    pub fn ensemble_at(&self, entry_id: i64) -> &[BookieId] {
        self.ensembles
            .range(..=entry_id)
            .next_back()
            .or_else(|| self.ensembles.iter().next())
            .map_or(&[], |(_, ensemble)| ensemble.as_slice())
    }

    /// Returns the most recent ensemble together with its first entry id.
    #[must_use]
    pub fn last_ensemble(&self) -> (i64, &[BookieId]) {
        self.ensembles
            .iter()
            .next_back()
            .map_or((0, &[][..]), |(first, ensemble)| (*first, ensemble.as_slice()))
    }

    /// Returns every bookie that has ever been a member of the ledger.
    #[must_use]
    pub fn all_bookies(&self) -> Vec<BookieId> {
        let mut bookies: Vec<BookieId> = self.ensembles.values().flatten().cloned().collect();
        bookies.sort();
        bookies.dedup();
        bookies
    }
}

/// A value together with the store version it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    /// The stored value.
    pub value: T,
    /// Monotonic version, bumped on every successful write.
    pub version: u64,
}

impl<T> Versioned<T> {
    /// Wraps a value with its version.
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

/// Persistence contract for ledger metadata.
///
/// Consensus and durability of the store are the implementation's concern;
/// the client only relies on versioned compare-and-set writes.
#[async_trait]
pub trait LedgerMetadataStore: Send + Sync + std::fmt::Debug {
    /// Allocates a ledger id that is not in use.
    async fn generate_ledger_id(&self) -> MetadataResult<LedgerId>;

    /// Stores metadata for a new ledger.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::LedgerExists`](crate::MetadataError::LedgerExists)
    /// if the id is taken.
    async fn create_ledger_metadata(
        &self,
        ledger_id: LedgerId,
        metadata: LedgerMetadata,
    ) -> MetadataResult<Versioned<LedgerMetadata>>;

    /// Reads the current metadata of a ledger.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::NoSuchLedger`](crate::MetadataError::NoSuchLedger)
    /// if the ledger does not exist.
    async fn read_ledger_metadata(
        &self,
        ledger_id: LedgerId,
    ) -> MetadataResult<Versioned<LedgerMetadata>>;

    /// Replaces the metadata if the stored version equals `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::BadVersion`](crate::MetadataError::BadVersion)
    /// on a version mismatch.
    async fn write_ledger_metadata(
        &self,
        ledger_id: LedgerId,
        metadata: LedgerMetadata,
        expected_version: u64,
    ) -> MetadataResult<Versioned<LedgerMetadata>>;

    /// Deletes the metadata of a ledger.
    async fn remove_ledger_metadata(&self, ledger_id: LedgerId) -> MetadataResult<()>;

    /// Returns `true` if metadata exists for the ledger.
    async fn ledger_exists(&self, ledger_id: LedgerId) -> MetadataResult<bool>;
}
