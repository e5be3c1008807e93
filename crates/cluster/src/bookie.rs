//! Point-to-point contract with a single storage node.
//!
//! The ledger client never talks to the network itself: every request to a
//! bookie goes through [`BookieClient`]. Implementations own transport,
//! serialization and any per-request retry. Each call completes exactly once.
//!
//! Responses are folded into a [`NodeOutcome`] before they reach a pending
//! operation, so that a deadline expiring and a bookie answering with an
//! error travel through the same quorum arithmetic.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::{BookieError, BookieResult},
    types::{BookieId, LedgerId},
};

/// Flags carried by an add request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Set by a recovering reader re-replicating entries of a fenced ledger.
    /// Such adds are accepted even though the ledger is fenced.
    pub recovery: bool,
}

impl WriteFlags {
    /// Flags for a recovery add.
    #[must_use]
    pub fn recovery() -> Self {
        Self { recovery: true }
    }
}

/// Flags carried by read requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadFlags {
    /// Plain read.
    #[default]
    Normal,
    /// Read that also fences the ledger on the bookie, refusing any further
    /// non-recovery add. The master key proves the reader knows the password.
    Fence {
        /// Master key derived from the ledger password.
        master_key: Bytes,
    },
}

/// Asynchronous RPC surface of one bookie.
///
/// `payload` and returned frames are sealed entries as produced by the
/// client's digest layer; a bookie stores and returns them opaquely.
#[async_trait]
pub trait BookieClient: Send + Sync + Debug {
    /// Stores one sealed entry.
    async fn add_entry(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        entry_id: i64,
        master_key: &[u8],
        payload: Bytes,
        flags: WriteFlags,
    ) -> BookieResult<()>;

    /// Reads one sealed entry.
    async fn read_entry(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        entry_id: i64,
        flags: ReadFlags,
    ) -> BookieResult<Bytes>;

    /// Reads consecutive sealed entries starting at `start_entry_id`.
    ///
    /// Returns at least the first entry when present, then stops at
    /// `max_count` entries or once the next frame would push the response
    /// past `max_size` bytes.
    async fn batch_read_entries(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        start_entry_id: i64,
        max_count: usize,
        max_size: usize,
    ) -> BookieResult<Vec<Bytes>>;

    /// Returns the highest sealed entry the bookie holds for the ledger, or
    /// `None` when it holds the ledger but no entry yet.
    async fn read_last_confirmed(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        flags: ReadFlags,
    ) -> BookieResult<Option<Bytes>>;
}

/// Result of one per-bookie request as seen by a pending operation.
#[derive(Debug, Clone)]
pub enum NodeOutcome<T> {
    /// The bookie answered successfully.
    Success(T),
    /// The bookie answered with an error.
    Failure(BookieError),
    /// No answer arrived before the deadline.
    Timeout,
}

impl<T> NodeOutcome<T> {
    /// Folds a bookie response and its deadline into an outcome.
    ///
    /// `None` means the deadline elapsed first.
    pub fn from_response(response: Option<BookieResult<T>>) -> Self {
        match response {
            Some(Ok(value)) => Self::Success(value),
            Some(Err(BookieError::Timeout)) | None => Self::Timeout,
            Some(Err(err)) => Self::Failure(err),
        }
    }

    /// Returns `true` for a successful answer.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Converts the outcome back into a result, timeouts becoming
    /// [`BookieError::Timeout`].
    pub fn into_result(self) -> BookieResult<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
            Self::Timeout => Err(BookieError::Timeout),
        }
    }
}
