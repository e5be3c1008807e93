//! Pending-operation state machines.
//!
//! Each in-flight operation is a small state machine that consumes per-bookie
//! [`NodeOutcome`]s and becomes terminal exactly once. Outcomes arriving
//! after that are dropped. The machines hold no I/O; the functions in this
//! module issue the bookie requests, bounded by the configured deadlines, and
//! fold each response into a [`NodeOutcome`].

pub(crate) mod add;
pub(crate) mod batch_read;
pub(crate) mod read;
pub(crate) mod read_lac;

use std::{future::Future, time::Duration};

use bytes::Bytes;
use fail::fail_point;
use quorumlog_cluster::{BookieError, BookieId, BookieResult, LedgerId, NodeOutcome, ReadFlags, WriteFlags};

use crate::{client::ClientShared, error::{LedgerError, LedgerResult}};

/// Result of feeding one outcome into a state machine.
#[derive(Debug)]
pub(crate) enum Progress<T> {
    /// More outcomes are needed.
    Waiting,
    /// The operation just became terminal.
    Complete(LedgerResult<T>),
}

async fn with_deadline<T>(deadline: Duration, request: impl Future<Output = BookieResult<T>>) -> NodeOutcome<T> {
    NodeOutcome::from_response(tokio::time::timeout(deadline, request).await.ok())
}

pub(crate) async fn send_add(
    shared: &ClientShared,
    bookie: &BookieId,
    ledger_id: LedgerId,
    entry_id: i64,
    master_key: &[u8],
    frame: Bytes,
    flags: WriteFlags,
) -> NodeOutcome<()> {
    fail_point!("add-entry-send", |_| {
        NodeOutcome::Failure(BookieError::internal("injected add failure"))
    });
    let request = shared.context.bookie_client.add_entry(bookie, ledger_id, entry_id, master_key, frame, flags);
    with_deadline(shared.config.add_entry_timeout(), request).await
}

pub(crate) async fn send_read(
    shared: &ClientShared,
    bookie: &BookieId,
    ledger_id: LedgerId,
    entry_id: i64,
) -> NodeOutcome<Bytes> {
    fail_point!("read-entry-send", |_| {
        NodeOutcome::Failure(BookieError::internal("injected read failure"))
    });
    let request = shared.context.bookie_client.read_entry(bookie, ledger_id, entry_id, ReadFlags::Normal);
    with_deadline(shared.config.read_entry_timeout(), request).await
}

pub(crate) async fn send_batch_read(
    shared: &ClientShared,
    bookie: &BookieId,
    ledger_id: LedgerId,
    start_entry_id: i64,
    max_count: usize,
    max_size: usize,
) -> NodeOutcome<Vec<Bytes>> {
    fail_point!("read-entry-send", |_| {
        NodeOutcome::Failure(BookieError::internal("injected read failure"))
    });
    let request = shared.context.bookie_client.batch_read_entries(
        bookie,
        ledger_id,
        start_entry_id,
        max_count,
        max_size,
    );
    with_deadline(shared.config.read_entry_timeout(), request).await
}

pub(crate) async fn send_read_last_confirmed(
    shared: &ClientShared,
    bookie: &BookieId,
    ledger_id: LedgerId,
    flags: ReadFlags,
) -> NodeOutcome<Option<Bytes>> {
    let request = shared.context.bookie_client.read_last_confirmed(bookie, ledger_id, flags);
    with_deadline(shared.config.read_entry_timeout(), request).await
}

/// Tally of failed read responses, by cause.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ReadFailures {
    unreachable: usize,
    missing: usize,
    digest: usize,
    other: usize,
}

impl ReadFailures {
    pub(crate) fn record(&mut self, outcome: &NodeOutcome<impl Sized>) {
        match outcome {
            NodeOutcome::Timeout => self.unreachable += 1,
            NodeOutcome::Failure(err) if err.is_unreachable() => self.unreachable += 1,
            NodeOutcome::Failure(err) if err.is_missing_data() => self.missing += 1,
            NodeOutcome::Failure(_) => self.other += 1,
            NodeOutcome::Success(_) => {},
        }
    }

    pub(crate) fn record_digest_failure(&mut self) {
        self.digest += 1;
    }

    pub(crate) fn total(&self) -> usize {
        self.unreachable + self.missing + self.digest + self.other
    }

    /// Error for a read of `entry_id` that every candidate failed.
    ///
    /// `missing_quorum` is the number of "no such entry" answers needed to
    /// conclude the entry was never acknowledged.
    pub(crate) fn into_error(self, ledger_id: LedgerId, entry_id: i64, missing_quorum: usize) -> LedgerError {
        if self.digest > 0 {
            LedgerError::DigestMismatch { ledger_id, entry_id }
        } else if self.missing >= missing_quorum && self.missing > 0 {
            LedgerError::NoSuchEntry { ledger_id, entry_id }
        } else if self.unreachable == self.total() {
            LedgerError::BookieUnavailable { ledger_id }
        } else {
            LedgerError::read(
                ledger_id,
                format!(
                    "entry {entry_id} unreadable: {} unreachable, {} missing, {} failed",
                    self.unreachable, self.missing, self.other
                ),
            )
        }
    }
}
