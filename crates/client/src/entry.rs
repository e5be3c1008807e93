//! Entries returned by reads.

use bytes::Bytes;
use quorumlog_cluster::LedgerId;

use crate::digest::VerifiedEntry;

/// A verified entry read back from a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    ledger_id: LedgerId,
    entry_id: i64,
    length: u64,
    payload: Bytes,
}

impl LedgerEntry {
    pub(crate) fn from_verified(ledger_id: LedgerId, entry: VerifiedEntry) -> Self {
        Self {
            ledger_id,
            entry_id: entry.entry_id,
            length: entry.ledger_length,
            payload: entry.payload,
        }
    }

    /// Ledger the entry belongs to.
    #[must_use]
    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    /// Sequential id of the entry.
    #[must_use]
    pub fn entry_id(&self) -> i64 {
        self.entry_id
    }

    /// Ledger length in bytes after this entry.
    #[must_use]
    pub fn ledger_length(&self) -> u64 {
        self.length
    }

    /// The payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the entry, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
