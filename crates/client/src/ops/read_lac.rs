//! Last-add-confirmed discovery.
//!
//! Every bookie of the ensemble is asked for the highest entry it stores.
//! Each verified frame piggybacks the writer's last-add-confirmed at the
//! time it was sealed; the op adopts the highest one seen. The answer is
//! trusted once the responses cover every write set (see
//! [`CoverageSet`](crate::schedule::CoverageSet)). The same op, sent with the
//! fence flag, fences the ledger for recovery.

use std::sync::Arc;

use bytes::Bytes;
use quorumlog_cluster::{BookieId, ClientStats, LedgerId, NodeOutcome, ReadFlags, INVALID_ENTRY_ID};
use tokio::sync::mpsc;

use super::{send_read_last_confirmed, Progress};
use crate::{
    client::ClientShared,
    digest::DigestManager,
    error::{LedgerError, LedgerResult},
    schedule::{CoverageSet, DistributionSchedule},
};

/// When a last-add-confirmed query may complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LacMode {
    /// Wait until the responses cover the ensemble.
    Covered,
    /// Complete on the first verified response.
    FirstResponse,
}

#[derive(Debug)]
pub(crate) struct ReadLastConfirmedOp {
    ledger_id: LedgerId,
    mode: LacMode,
    coverage: CoverageSet,
    max_lac: i64,
    unreachable: usize,
    failures: usize,
    responses: usize,
    ensemble_size: usize,
    complete: bool,
}

impl ReadLastConfirmedOp {
    pub(crate) fn new(ledger_id: LedgerId, schedule: &DistributionSchedule, mode: LacMode) -> Self {
        Self {
            ledger_id,
            mode,
            coverage: schedule.coverage_set(),
            max_lac: INVALID_ENTRY_ID,
            unreachable: 0,
            failures: 0,
            responses: 0,
            ensemble_size: schedule.quorum().ensemble_size(),
            complete: false,
        }
    }

    pub(crate) fn on_outcome(
        &mut self,
        digest: &DigestManager,
        stats: &ClientStats,
        position: usize,
        outcome: NodeOutcome<Option<Bytes>>,
    ) -> Progress<i64> {
        if self.complete {
            return Progress::Waiting;
        }
        self.responses += 1;
        let reachable = match outcome {
            NodeOutcome::Success(Some(frame)) => match digest.verify(&frame) {
                Ok(entry) => {
                    self.max_lac = self.max_lac.max(entry.last_add_confirmed);
                    if self.mode == LacMode::FirstResponse {
                        return self.finish(Ok(self.max_lac));
                    }
                    self.coverage.add_answer(position);
                    true
                },
                Err(err) => {
                    tracing::warn!(ledger_id = %self.ledger_id, position, error = %err, "last-confirmed response failed verification");
                    stats.record_digest_mismatch();
                    self.failures += 1;
                    self.coverage.add_failure(position)
                },
            },
            NodeOutcome::Success(None) => {
                self.coverage.add_answer(position);
                true
            },
            NodeOutcome::Failure(err) if err.is_missing_data() => {
                self.coverage.add_answer(position);
                true
            },
            NodeOutcome::Failure(err) => {
                if err.is_unreachable() {
                    self.unreachable += 1;
                }
                self.failures += 1;
                tracing::debug!(ledger_id = %self.ledger_id, position, error = %err, "last-confirmed query failed");
                self.coverage.add_failure(position)
            },
            NodeOutcome::Timeout => {
                self.unreachable += 1;
                self.failures += 1;
                self.coverage.add_failure(position)
            },
        };

        if self.mode == LacMode::Covered && self.coverage.is_covered() {
            return self.finish(Ok(self.max_lac));
        }
        if self.mode == LacMode::FirstResponse && self.responses >= self.ensemble_size {
            // Nobody returned data: every bookie that answered stores nothing.
            if self.failures < self.ensemble_size {
                return self.finish(Ok(self.max_lac));
            }
            return self.finish(Err(self.failure_error()));
        }
        if self.mode == LacMode::Covered && !reachable {
            return self.finish(Err(self.failure_error()));
        }
        Progress::Waiting
    }

    fn failure_error(&self) -> LedgerError {
        if self.unreachable == self.failures {
            LedgerError::BookieUnavailable { ledger_id: self.ledger_id }
        } else {
            LedgerError::read(
                self.ledger_id,
                format!("last-add-confirmed unavailable: {} of {} bookies failed", self.failures, self.ensemble_size),
            )
        }
    }

    fn finish(&mut self, result: LedgerResult<i64>) -> Progress<i64> {
        self.complete = true;
        Progress::Complete(result)
    }
}

/// Queries every bookie of `ensemble` at once and runs `op` over the answers.
///
/// Requests still in flight when the op completes are left to finish, so a
/// fencing query reaches every bookie that is up.
pub(crate) async fn read_last_confirmed(
    shared: &Arc<ClientShared>,
    digest: &DigestManager,
    ensemble: &[BookieId],
    flags: ReadFlags,
    mut op: ReadLastConfirmedOp,
) -> LedgerResult<i64> {
    let ledger_id = digest.ledger_id();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (position, bookie) in ensemble.iter().cloned().enumerate() {
        let tx = tx.clone();
        let shared = Arc::clone(shared);
        let flags = flags.clone();
        tokio::spawn(async move {
            let outcome = send_read_last_confirmed(&shared, &bookie, ledger_id, flags).await;
            let _ = tx.send((position, outcome));
        });
    }
    drop(tx);

    let stats = Arc::clone(&shared.context.stats);
    while let Some((position, outcome)) = rx.recv().await {
        if let Progress::Complete(result) = op.on_outcome(digest, &stats, position, outcome) {
            stats.record_lac_read(result.is_ok());
            return result;
        }
    }
    stats.record_lac_read(false);
    Err(LedgerError::BookieUnavailable { ledger_id })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use quorumlog_cluster::{BookieError, DigestType, QuorumSizes};

    use super::*;

    fn setup(e: usize, w: usize, a: usize, mode: LacMode) -> (DigestManager, ReadLastConfirmedOp) {
        let schedule = DistributionSchedule::new(QuorumSizes::new(e, w, a).unwrap());
        let ledger_id = LedgerId::from(5);
        (DigestManager::new(ledger_id, DigestType::Crc32, b"pw"), ReadLastConfirmedOp::new(ledger_id, &schedule, mode))
    }

    #[test]
    fn adopts_highest_piggybacked_lac_once_covered() {
        let (digest, mut op) = setup(3, 3, 2, LacMode::Covered);
        let stats = ClientStats::new();

        let older = digest.compute_digest_and_package(4, 3, 40, b"x");
        let newer = digest.compute_digest_and_package(5, 4, 50, b"y");
        assert!(matches!(op.on_outcome(&digest, &stats, 0, NodeOutcome::Success(Some(older))), Progress::Waiting));
        assert!(matches!(
            op.on_outcome(&digest, &stats, 1, NodeOutcome::Success(Some(newer))),
            Progress::Complete(Ok(4))
        ));
    }

    #[test]
    fn missing_ledger_counts_as_answer() {
        let (digest, mut op) = setup(2, 2, 2, LacMode::Covered);
        let missing = NodeOutcome::Failure(BookieError::no_such_ledger(LedgerId::from(5)));
        assert!(matches!(
            op.on_outcome(&digest, &ClientStats::new(), 0, missing),
            Progress::Complete(Ok(INVALID_ENTRY_ID))
        ));
    }

    #[test]
    fn unreachable_ensemble_is_bookie_unavailable() {
        let (digest, mut op) = setup(3, 3, 3, LacMode::Covered);
        let stats = ClientStats::new();
        let mut last = Progress::Waiting;
        for position in 0..3 {
            last = op.on_outcome(&digest, &stats, position, NodeOutcome::Timeout);
            if matches!(last, Progress::Complete(_)) {
                break;
            }
        }
        assert!(matches!(last, Progress::Complete(Err(LedgerError::BookieUnavailable { .. }))));
    }

    #[test]
    fn first_response_mode_ignores_coverage() {
        let (digest, mut op) = setup(3, 2, 2, LacMode::FirstResponse);
        let frame = digest.compute_digest_and_package(9, 8, 1, b"z");
        assert!(matches!(
            op.on_outcome(&digest, &ClientStats::new(), 2, NodeOutcome::Success(Some(frame))),
            Progress::Complete(Ok(8))
        ));
    }

    #[test]
    fn corrupt_frame_counts_as_failure() {
        let (digest, mut op) = setup(3, 3, 1, LacMode::Covered);
        let stats = ClientStats::new();
        let other_ledger = DigestManager::new(LedgerId::from(6), DigestType::Crc32, b"pw")
            .compute_digest_and_package(1, 0, 1, b"q");
        let progress = op.on_outcome(&digest, &stats, 0, NodeOutcome::Success(Some(other_ledger)));
        assert!(matches!(progress, Progress::Complete(Err(LedgerError::Read { .. }))));
        assert_eq!(stats.snapshot().digest_mismatches, 1);
    }
}
