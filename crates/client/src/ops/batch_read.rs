//! Batch reads served by a single bookie.
//!
//! When every bookie stores every entry, one bookie can answer for a whole
//! run of entries. The op asks the candidates in turn and accepts the first
//! answer whose frames all verify, trimmed to the requested count and byte
//! budget. The first entry is always kept.

use std::sync::Arc;

use bytes::Bytes;
use quorumlog_cluster::{BookieError, BookieId, ClientStats, LedgerId, NodeOutcome};

use super::{send_batch_read, Progress, ReadFailures};
use crate::{
    client::ClientShared,
    digest::DigestManager,
    entry::LedgerEntry,
    error::{LedgerError, LedgerResult},
};

#[derive(Debug)]
pub(crate) struct BatchReadOp {
    ledger_id: LedgerId,
    start_entry_id: i64,
    max_count: usize,
    max_size: usize,
    candidates: Vec<BookieId>,
    failures: ReadFailures,
    complete: bool,
}

impl BatchReadOp {
    pub(crate) fn new(
        ledger_id: LedgerId,
        start_entry_id: i64,
        max_count: usize,
        max_size: usize,
        candidates: Vec<BookieId>,
    ) -> Self {
        Self {
            ledger_id,
            start_entry_id,
            max_count,
            max_size,
            candidates,
            failures: ReadFailures::default(),
            complete: false,
        }
    }

    pub(crate) fn on_outcome(
        &mut self,
        digest: &DigestManager,
        stats: &ClientStats,
        bookie: &BookieId,
        outcome: NodeOutcome<Vec<Bytes>>,
    ) -> Progress<Vec<LedgerEntry>> {
        if self.complete {
            return Progress::Waiting;
        }
        match outcome {
            NodeOutcome::Success(frames) if frames.is_empty() => {
                let missing = BookieError::no_such_entry(self.ledger_id, self.start_entry_id);
                self.failures.record(&NodeOutcome::<()>::Failure(missing));
            },
            NodeOutcome::Success(frames) => match self.verify_frames(digest, &frames) {
                Ok(entries) => {
                    self.complete = true;
                    return Progress::Complete(Ok(entries));
                },
                Err(message) => {
                    tracing::warn!(
                        ledger_id = %self.ledger_id,
                        start_entry_id = self.start_entry_id,
                        bookie = %bookie,
                        error = %message,
                        "batch read response failed verification"
                    );
                    stats.record_digest_mismatch();
                    self.failures.record_digest_failure();
                },
            },
            failed => {
                tracing::debug!(
                    ledger_id = %self.ledger_id,
                    start_entry_id = self.start_entry_id,
                    bookie = %bookie,
                    outcome = ?failed,
                    "batch read from bookie failed"
                );
                self.failures.record(&failed);
            },
        }
        if self.failures.total() >= self.candidates.len() {
            self.complete = true;
            return Progress::Complete(Err(self.failures.into_error(self.ledger_id, self.start_entry_id, 1)));
        }
        Progress::Waiting
    }

    fn verify_frames(&self, digest: &DigestManager, frames: &[Bytes]) -> Result<Vec<LedgerEntry>, String> {
        let mut entries = Vec::with_capacity(frames.len().min(self.max_count));
        let mut size = 0usize;
        for (offset, frame) in frames.iter().take(self.max_count).enumerate() {
            let expected = self.start_entry_id + i64::try_from(offset).unwrap_or(i64::MAX);
            let verified = digest.verify_entry(expected, frame).map_err(|err| err.to_string())?;
            if !entries.is_empty() && size + verified.payload.len() > self.max_size {
                break;
            }
            size += verified.payload.len();
            entries.push(LedgerEntry::from_verified(self.ledger_id, verified));
        }
        Ok(entries)
    }
}

/// Asks each candidate in turn for the whole batch.
pub(crate) async fn batch_read(
    shared: &Arc<ClientShared>,
    digest: &DigestManager,
    mut op: BatchReadOp,
) -> LedgerResult<Vec<LedgerEntry>> {
    let stats = Arc::clone(&shared.context.stats);
    for bookie in op.candidates.clone() {
        let outcome =
            send_batch_read(shared, &bookie, op.ledger_id, op.start_entry_id, op.max_count, op.max_size).await;
        if let Progress::Complete(result) = op.on_outcome(digest, &stats, &bookie, outcome) {
            return result;
        }
    }
    Err(LedgerError::read(op.ledger_id, "no bookie to batch read from"))
}

/// Keeps the longest prefix of `entries` within `max_size` payload bytes, never fewer than one.
pub(crate) fn trim_to_budget(entries: Vec<LedgerEntry>, max_size: usize) -> Vec<LedgerEntry> {
    let mut size = 0usize;
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        if !kept.is_empty() && size + entry.payload().len() > max_size {
            break;
        }
        size += entry.payload().len();
        kept.push(entry);
    }
    kept
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use quorumlog_cluster::DigestType;

    use super::*;

    fn digest() -> DigestManager {
        DigestManager::new(LedgerId::from(2), DigestType::Crc32c, b"")
    }

    fn frames(digest: &DigestManager, start: i64, sizes: &[usize]) -> Vec<Bytes> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                let id = start + i as i64;
                digest.compute_digest_and_package(id, id - 1, 0, &vec![7u8; *size])
            })
            .collect()
    }

    fn op(max_count: usize, max_size: usize) -> BatchReadOp {
        BatchReadOp::new(LedgerId::from(2), 4, max_count, max_size, vec![BookieId::from("a"), BookieId::from("b")])
    }

    #[test]
    fn trims_to_count_and_budget() {
        let digest = digest();
        let stats = ClientStats::new();

        let mut by_count = op(2, 1_000);
        let Progress::Complete(Ok(entries)) = by_count.on_outcome(
            &digest,
            &stats,
            &BookieId::from("a"),
            NodeOutcome::Success(frames(&digest, 4, &[10, 10, 10])),
        ) else {
            panic!("expected completion")
        };
        assert_eq!(entries.len(), 2);

        let mut by_size = op(10, 25);
        let Progress::Complete(Ok(entries)) = by_size.on_outcome(
            &digest,
            &stats,
            &BookieId::from("a"),
            NodeOutcome::Success(frames(&digest, 4, &[10, 10, 10])),
        ) else {
            panic!("expected completion")
        };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn oversized_first_entry_is_still_returned() {
        let digest = digest();
        let mut tiny = op(10, 1);
        let Progress::Complete(Ok(entries)) = tiny.on_outcome(
            &digest,
            &ClientStats::new(),
            &BookieId::from("a"),
            NodeOutcome::Success(frames(&digest, 4, &[100, 1])),
        ) else {
            panic!("expected completion")
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_id(), 4);
    }

    #[test]
    fn out_of_sequence_frame_fails_over() {
        let digest = digest();
        let stats = ClientStats::new();
        let mut batch = op(3, 1_000);

        let progress = batch.on_outcome(
            &digest,
            &stats,
            &BookieId::from("a"),
            NodeOutcome::Success(frames(&digest, 5, &[1, 1])),
        );
        assert!(matches!(progress, Progress::Waiting));

        let progress = batch.on_outcome(
            &digest,
            &stats,
            &BookieId::from("b"),
            NodeOutcome::Success(frames(&digest, 4, &[1, 1])),
        );
        assert!(matches!(progress, Progress::Complete(Ok(ref entries)) if entries.len() == 2));
    }

    #[test]
    fn trim_keeps_first_entry() {
        let digest = digest();
        let entries: Vec<LedgerEntry> = frames(&digest, 0, &[50, 5])
            .iter()
            .map(|f| LedgerEntry::from_verified(LedgerId::from(2), digest.verify(f).unwrap()))
            .collect();
        assert_eq!(trim_to_budget(entries.clone(), 10).len(), 1);
        assert_eq!(trim_to_budget(entries, 55).len(), 2);
    }
}
