//! A sealed entry on its way to an ack quorum.

use std::{collections::BTreeMap, time::Instant};

use bytes::Bytes;
use quorumlog_cluster::BookieId;

use crate::{completion::AddCompletion, schedule::AckSet};

/// Pending state of one add.
///
/// Tracks which bookie each write-set position was sent to, so a response
/// from a bookie that has since been replaced is recognized as stale.
pub(crate) struct PendingAddOp {
    pub(crate) entry_id: i64,
    pub(crate) frame: Bytes,
    /// Ledger length after this entry.
    pub(crate) ledger_length: u64,
    pub(crate) ack_set: AckSet,
    targets: BTreeMap<usize, BookieId>,
    pub(crate) completion: Option<AddCompletion>,
    pub(crate) started: Instant,
}

impl std::fmt::Debug for PendingAddOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAddOp")
            .field("entry_id", &self.entry_id)
            .field("acks", &self.ack_set.acks())
            .field("dispatched", &self.is_dispatched())
            .finish_non_exhaustive()
    }
}

impl PendingAddOp {
    pub(crate) fn new(
        entry_id: i64,
        frame: Bytes,
        ledger_length: u64,
        ack_set: AckSet,
        completion: AddCompletion,
    ) -> Self {
        Self {
            entry_id,
            frame,
            ledger_length,
            ack_set,
            targets: BTreeMap::new(),
            completion: Some(completion),
            started: Instant::now(),
        }
    }

    /// Whether the entry has been sent to an ensemble yet.
    pub(crate) fn is_dispatched(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Assigns the write set to bookies of `ensemble`, returning the sends to issue.
    pub(crate) fn dispatch(&mut self, ensemble: &[BookieId]) -> Vec<(usize, BookieId)> {
        let sends: Vec<(usize, BookieId)> = self
            .ack_set
            .write_set()
            .iter()
            .filter_map(|position| ensemble.get(*position).map(|bookie| (*position, bookie.clone())))
            .collect();
        self.targets = sends.iter().cloned().collect();
        sends
    }

    /// Points `position` at a replacement bookie and forgets its earlier outcome.
    ///
    /// Returns `true` if this op stores data at `position` and must be resent.
    pub(crate) fn replace(&mut self, position: usize, bookie: &BookieId) -> bool {
        if self.ack_set.state(position).is_none() {
            return false;
        }
        self.ack_set.reset(position);
        if self.is_dispatched() {
            self.targets.insert(position, bookie.clone());
            true
        } else {
            false
        }
    }

    /// Returns `true` if `bookie` is the current target of `position`.
    pub(crate) fn is_current_target(&self, position: usize, bookie: &BookieId) -> bool {
        self.targets.get(&position) == Some(bookie)
    }
}
