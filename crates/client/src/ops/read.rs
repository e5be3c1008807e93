//! Entry reads with failover across the write set.
//!
//! A [`ReadEntryRequest`] asks the bookies of an entry's write set, in write
//! set order, until one returns a frame that passes digest verification. A
//! [`PendingReadOp`] gathers the requests of a range and fails the whole
//! range on the first entry that cannot be read.

use std::sync::Arc;

use bytes::Bytes;
use quorumlog_cluster::{BookieId, ClientStats, LedgerId, NodeOutcome};
use tokio::{sync::mpsc, task::JoinSet};

use super::{send_read, Progress, ReadFailures};
use crate::{
    client::ClientShared,
    digest::DigestManager,
    entry::LedgerEntry,
    error::{LedgerError, LedgerResult},
};

/// Read of a single entry.
#[derive(Debug)]
pub(crate) struct ReadEntryRequest {
    ledger_id: LedgerId,
    entry_id: i64,
    candidates: Vec<BookieId>,
    missing_quorum: usize,
    failures: ReadFailures,
    complete: bool,
}

impl ReadEntryRequest {
    /// `missing_quorum` "no such entry" answers make the entry count as absent.
    pub(crate) fn new(ledger_id: LedgerId, entry_id: i64, candidates: Vec<BookieId>, missing_quorum: usize) -> Self {
        Self { ledger_id, entry_id, candidates, missing_quorum, failures: ReadFailures::default(), complete: false }
    }

    pub(crate) fn entry_id(&self) -> i64 {
        self.entry_id
    }

    pub(crate) fn candidates(&self) -> &[BookieId] {
        &self.candidates
    }

    pub(crate) fn on_outcome(
        &mut self,
        digest: &DigestManager,
        stats: &ClientStats,
        bookie: &BookieId,
        outcome: NodeOutcome<Bytes>,
    ) -> Progress<LedgerEntry> {
        if self.complete {
            return Progress::Waiting;
        }
        match outcome {
            NodeOutcome::Success(frame) => match digest.verify_entry(self.entry_id, &frame) {
                Ok(verified) => {
                    self.complete = true;
                    return Progress::Complete(Ok(LedgerEntry::from_verified(self.ledger_id, verified)));
                },
                Err(err) => {
                    tracing::warn!(
                        ledger_id = %self.ledger_id,
                        entry_id = self.entry_id,
                        bookie = %bookie,
                        error = %err,
                        "read response failed verification"
                    );
                    stats.record_digest_mismatch();
                    self.failures.record_digest_failure();
                },
            },
            failed => {
                tracing::debug!(
                    ledger_id = %self.ledger_id,
                    entry_id = self.entry_id,
                    bookie = %bookie,
                    outcome = ?failed,
                    "read from bookie failed"
                );
                self.failures.record(&failed);
            },
        }
        if self.failures.total() >= self.candidates.len() {
            self.complete = true;
            return Progress::Complete(Err(self.failures.into_error(
                self.ledger_id,
                self.entry_id,
                self.missing_quorum,
            )));
        }
        Progress::Waiting
    }
}

/// Read of a contiguous range of entries.
#[derive(Debug)]
pub(crate) struct PendingReadOp {
    entries: Vec<Option<LedgerEntry>>,
    remaining: usize,
    complete: bool,
}

impl PendingReadOp {
    pub(crate) fn new(count: usize) -> Self {
        Self { entries: vec![None; count], remaining: count, complete: count == 0 }
    }

    /// Records the result for the entry at `index` within the range.
    pub(crate) fn on_entry(&mut self, index: usize, result: LedgerResult<LedgerEntry>) -> Progress<Vec<LedgerEntry>> {
        if self.complete {
            return Progress::Waiting;
        }
        match result {
            Ok(entry) => {
                if let Some(slot) = self.entries.get_mut(index) {
                    if slot.replace(entry).is_none() {
                        self.remaining -= 1;
                    }
                }
                if self.remaining > 0 {
                    return Progress::Waiting;
                }
                self.complete = true;
                Progress::Complete(Ok(self.entries.drain(..).flatten().collect()))
            },
            Err(err) => {
                self.complete = true;
                Progress::Complete(Err(err))
            },
        }
    }
}

/// Reads one entry, asking candidates one after another or all at once.
pub(crate) async fn read_entry(
    shared: Arc<ClientShared>,
    digest: Arc<DigestManager>,
    mut request: ReadEntryRequest,
) -> LedgerResult<LedgerEntry> {
    let ledger_id = digest.ledger_id();
    let stats = Arc::clone(&shared.context.stats);

    if shared.config.parallel_reads() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for bookie in request.candidates().to_vec() {
            let tx = tx.clone();
            let shared = Arc::clone(&shared);
            let entry_id = request.entry_id();
            tokio::spawn(async move {
                let outcome = send_read(&shared, &bookie, ledger_id, entry_id).await;
                let _ = tx.send((bookie, outcome));
            });
        }
        drop(tx);
        while let Some((bookie, outcome)) = rx.recv().await {
            if let Progress::Complete(result) = request.on_outcome(&digest, &stats, &bookie, outcome) {
                return result;
            }
        }
    } else {
        for bookie in request.candidates().to_vec() {
            let outcome = send_read(&shared, &bookie, ledger_id, request.entry_id()).await;
            if let Progress::Complete(result) = request.on_outcome(&digest, &stats, &bookie, outcome) {
                return result;
            }
        }
    }
    Err(LedgerError::read(ledger_id, format!("no bookie to read entry {} from", request.entry_id())))
}

/// Reads every request concurrently, failing on the first entry that fails.
pub(crate) async fn read_range(
    shared: &Arc<ClientShared>,
    digest: &Arc<DigestManager>,
    requests: Vec<ReadEntryRequest>,
) -> LedgerResult<Vec<LedgerEntry>> {
    let mut op = PendingReadOp::new(requests.len());
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    let mut tasks = JoinSet::new();
    for (index, request) in requests.into_iter().enumerate() {
        let shared = Arc::clone(shared);
        let digest = Arc::clone(digest);
        tasks.spawn(async move { (index, read_entry(shared, digest, request).await) });
    }

    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|err| {
            LedgerError::unexpected_condition(format!("read task failed: {err}"))
        })?;
        if let Progress::Complete(result) = op.on_entry(index, result) {
            return result;
        }
    }
    Err(LedgerError::unexpected_condition("range read ended without a result"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use quorumlog_cluster::{BookieError, DigestType};

    use super::*;

    fn digest() -> DigestManager {
        DigestManager::new(LedgerId::from(1), DigestType::Crc32, b"pw")
    }

    fn request(candidates: usize) -> ReadEntryRequest {
        let bookies = (0..candidates).map(|i| BookieId::new(format!("b{i}"))).collect();
        ReadEntryRequest::new(LedgerId::from(1), 3, bookies, 1)
    }

    #[test]
    fn first_verified_response_completes() {
        let digest = digest();
        let stats = ClientStats::new();
        let mut req = request(2);
        let frame = digest.compute_digest_and_package(3, 2, 10, b"data");

        let progress = req.on_outcome(&digest, &stats, &BookieId::from("b0"), NodeOutcome::Success(frame.clone()));
        let Progress::Complete(Ok(entry)) = progress else { panic!("expected completion") };
        assert_eq!(entry.payload().as_ref(), b"data");
        assert_eq!(entry.ledger_length(), 10);

        // Late responses are dropped.
        assert!(matches!(
            req.on_outcome(&digest, &stats, &BookieId::from("b1"), NodeOutcome::Success(frame)),
            Progress::Waiting
        ));
    }

    #[test]
    fn digest_failure_falls_over_then_reports_mismatch() {
        let digest = digest();
        let stats = ClientStats::new();
        let mut req = request(2);
        let wrong_entry = digest.compute_digest_and_package(4, 2, 10, b"data");

        assert!(matches!(
            req.on_outcome(&digest, &stats, &BookieId::from("b0"), NodeOutcome::Success(wrong_entry)),
            Progress::Waiting
        ));
        let progress = req.on_outcome(&digest, &stats, &BookieId::from("b1"), NodeOutcome::Timeout);
        assert!(matches!(progress, Progress::Complete(Err(LedgerError::DigestMismatch { entry_id: 3, .. }))));
        assert_eq!(stats.snapshot().digest_mismatches, 1);
    }

    #[test]
    fn every_candidate_unreachable() {
        let digest = digest();
        let stats = ClientStats::new();
        let mut req = request(2);
        req.on_outcome(
            &digest,
            &stats,
            &BookieId::from("b0"),
            NodeOutcome::Failure(BookieError::unavailable(BookieId::from("b0"))),
        );
        let progress = req.on_outcome(&digest, &stats, &BookieId::from("b1"), NodeOutcome::Timeout);
        assert!(matches!(progress, Progress::Complete(Err(LedgerError::BookieUnavailable { .. }))));
    }

    #[test]
    fn range_fails_on_first_error_and_orders_results() {
        let digest = digest();
        let entry = |id: i64| {
            let frame = digest.compute_digest_and_package(id, id - 1, 1, b"x");
            LedgerEntry::from_verified(LedgerId::from(1), digest.verify(&frame).unwrap())
        };

        let mut op = PendingReadOp::new(2);
        assert!(matches!(op.on_entry(1, Ok(entry(6))), Progress::Waiting));
        let Progress::Complete(Ok(entries)) = op.on_entry(0, Ok(entry(5))) else { panic!("expected completion") };
        assert_eq!(entries.iter().map(LedgerEntry::entry_id).collect::<Vec<_>>(), vec![5, 6]);

        let mut op = PendingReadOp::new(2);
        let err = LedgerError::read(LedgerId::from(1), "gone");
        assert!(matches!(op.on_entry(0, Err(err)), Progress::Complete(Err(LedgerError::Read { .. }))));
        assert!(matches!(op.on_entry(1, Ok(entry(6))), Progress::Waiting));
    }
}
