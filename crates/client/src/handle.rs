//! Ledger handles.
//!
//! A [`LedgerHandle`] owns the client-side view of one ledger: the cached
//! metadata, the write cursor, the last-add-confirmed (LAC) and the queue of
//! adds waiting for their ack quorum.
//!
//! # Adds
//!
//! Entry ids are assigned in acceptance order. Each add is sealed with the
//! current LAC, sent to its write set, and completed once its ack quorum is
//! met and every earlier add has completed, so LAC never passes a gap:
//!
//! ```text
//! pending: [ 7 acked ][ 8 waiting ][ 9 acked ]
//!                      ▲
//!                      LAC stays at 6 until 8 is acked, then jumps to 9
//! ```
//!
//! Bookie responses are applied on the ledger's ordered worker.
//!
//! # Ensemble changes
//!
//! When a bookie fails an add, the placement policy picks a replacement, the
//! new ensemble is recorded in metadata from `LAC + 1` onward, and every
//! pending add that was sent to the failed position is resent. Adds accepted
//! while a change is in flight wait for it and go straight to the new
//! ensemble.
//!
//! When no replacement exists the handle keeps writing to the degraded
//! ensemble. Only an add whose ack quorum has become unreachable fails the
//! ledger.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use fail::fail_point;
use parking_lot::Mutex;
use quorumlog_cluster::{
    BookieError, BookieId, DigestType, LedgerId, LedgerMetadata, LedgerState, MetadataError, NodeOutcome,
    ReadFlags, Versioned, WriteFlags, INVALID_ENTRY_ID,
};
use tokio::sync::{watch, OnceCell};

use crate::{
    client::ClientShared,
    completion::{
        self, AddCallback, AddCompletion, CallbackContext, Completion, LastConfirmedCallback,
        LastConfirmedCompletion, ReadCallback, ReadCompletion,
    },
    digest::DigestManager,
    entry::LedgerEntry,
    error::{LedgerError, LedgerResult},
    ops::{
        self,
        add::PendingAddOp,
        batch_read::{self, BatchReadOp},
        read::{self, ReadEntryRequest},
        read_lac::{self, LacMode, ReadLastConfirmedOp},
    },
    schedule::DistributionSchedule,
};

/// Whether a handle may append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleMode {
    Writable,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleStatus {
    Open,
    Closing,
    Closed,
}

struct HandleState {
    metadata: Versioned<LedgerMetadata>,
    status: HandleStatus,
    last_add_pushed: i64,
    pushed_length: u64,
    lac: i64,
    length: u64,
    pending_adds: VecDeque<PendingAddOp>,
    /// Positions being replaced by the ensemble change in flight.
    changing: Option<BTreeMap<usize, BookieId>>,
    /// Failures reported while a change was in flight.
    delayed_failures: BTreeMap<usize, BookieId>,
    failed_bookies: HashSet<BookieId>,
    /// Failed bookies the placement policy could not replace.
    unreplaceable: HashSet<BookieId>,
    fenced: bool,
    /// Set by an explicit `close`; a handle sealed by a failed add keeps serving reads.
    close_requested: bool,
}

impl HandleState {
    fn pending_index(&self, entry_id: i64) -> Option<usize> {
        let first = self.pending_adds.front()?.entry_id;
        let index = usize::try_from(entry_id.checked_sub(first)?).ok()?;
        (self.pending_adds.get(index)?.entry_id == entry_id).then_some(index)
    }
}

struct HandleInner {
    ledger_id: LedgerId,
    shared: Arc<ClientShared>,
    digest: Arc<DigestManager>,
    master_key: Bytes,
    schedule: DistributionSchedule,
    mode: HandleMode,
    state: Mutex<HandleState>,
    pending: watch::Sender<usize>,
    closed: OnceCell<LedgerResult<()>>,
}

type FinishedAdd = (AddCompletion, LedgerResult<i64>, Duration);

/// Handle to one ledger.
///
/// Cheaply cloneable; clones share the same cursors and pending adds.
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for LedgerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LedgerHandle")
            .field("ledger_id", &self.inner.ledger_id)
            .field("mode", &self.inner.mode)
            .field("status", &state.status)
            .field("lac", &state.lac)
            .field("pending_adds", &state.pending_adds.len())
            .finish()
    }
}

impl LedgerHandle {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        ledger_id: LedgerId,
        metadata: Versioned<LedgerMetadata>,
        password: &[u8],
        mode: HandleMode,
    ) -> Self {
        let digest = Arc::new(DigestManager::new(ledger_id, metadata.value.digest_type, password));
        let schedule = DistributionSchedule::new(metadata.value.quorum);
        let (lac, length) = if metadata.value.is_closed() {
            (metadata.value.last_entry_id, metadata.value.length)
        } else {
            (INVALID_ENTRY_ID, 0)
        };
        let state = HandleState {
            metadata,
            status: HandleStatus::Open,
            last_add_pushed: lac,
            pushed_length: length,
            lac,
            length,
            pending_adds: VecDeque::new(),
            changing: None,
            delayed_failures: BTreeMap::new(),
            failed_bookies: HashSet::new(),
            unreplaceable: HashSet::new(),
            fenced: false,
            close_requested: false,
        };
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(HandleInner {
                ledger_id,
                shared,
                digest,
                master_key: DigestManager::generate_master_key(password),
                schedule,
                mode,
                state: Mutex::new(state),
                pending,
                closed: OnceCell::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The ledger id.
    #[must_use]
    pub fn id(&self) -> LedgerId {
        self.inner.ledger_id
    }

    /// Highest entry id known to be stored on an ack quorum, with no gaps below it.
    #[must_use]
    pub fn last_add_confirmed(&self) -> i64 {
        self.inner.state.lock().lac
    }

    /// Highest entry id assigned by this handle.
    #[must_use]
    pub fn last_add_pushed(&self) -> i64 {
        self.inner.state.lock().last_add_pushed
    }

    /// Ledger length in bytes up to the last-add-confirmed.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.inner.state.lock().length
    }

    /// Returns `true` once the handle is closed or the ledger is sealed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let state = self.inner.state.lock();
        state.status != HandleStatus::Open || state.metadata.value.is_closed()
    }

    /// Returns `true` if this handle cannot append.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.mode == HandleMode::ReadOnly
    }

    /// Snapshot of the cached metadata.
    #[must_use]
    pub fn metadata(&self) -> LedgerMetadata {
        self.inner.state.lock().metadata.value.clone()
    }

    /// The application metadata attached at creation.
    #[must_use]
    pub fn custom_metadata(&self) -> BTreeMap<String, Vec<u8>> {
        self.inner.state.lock().metadata.value.custom_metadata.clone()
    }

    /// The digest kind sealing this ledger's entries.
    #[must_use]
    pub fn digest_type(&self) -> DigestType {
        self.inner.digest.digest_type()
    }

    /// Number of bookies the ledger is striped over.
    #[must_use]
    pub fn ensemble_size(&self) -> usize {
        self.inner.schedule.quorum().ensemble_size()
    }

    /// Number of bookies each entry is written to.
    #[must_use]
    pub fn write_quorum(&self) -> usize {
        self.inner.schedule.quorum().write_quorum()
    }

    /// Acknowledgements required before an add completes.
    #[must_use]
    pub fn ack_quorum(&self) -> usize {
        self.inner.schedule.quorum().ack_quorum()
    }

    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.inner.shared
    }

    pub(crate) fn digest(&self) -> &Arc<DigestManager> {
        &self.inner.digest
    }

    pub(crate) fn master_key(&self) -> &Bytes {
        &self.inner.master_key
    }

    pub(crate) fn schedule(&self) -> &DistributionSchedule {
        &self.inner.schedule
    }

    pub(crate) fn versioned_metadata(&self) -> Versioned<LedgerMetadata> {
        self.inner.state.lock().metadata.clone()
    }

    /// Replaces the cached metadata; a sealed record also fixes LAC and length.
    pub(crate) fn install_metadata(&self, metadata: Versioned<LedgerMetadata>) {
        let mut state = self.inner.state.lock();
        if metadata.value.is_closed() {
            state.lac = metadata.value.last_entry_id;
            state.length = metadata.value.length;
            state.last_add_pushed = state.last_add_pushed.max(state.lac);
        }
        state.metadata = metadata;
    }

    fn closed_error(&self) -> LedgerError {
        LedgerError::LedgerClosed { ledger_id: self.inner.ledger_id }
    }

    fn publish_pending(&self, state: &HandleState) {
        self.inner.pending.send_replace(state.pending_adds.len());
    }

    // ------------------------------------------------------------------
    // Adds
    // ------------------------------------------------------------------

    /// Appends `data` and waits for its ack quorum.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LedgerClosed`] on a closed or read-only handle
    /// - [`LedgerError::NotEnoughBookies`] if the ack quorum became unreachable
    /// - [`LedgerError::LedgerFenced`] if another client recovered the ledger
    #[tracing::instrument(skip(self, data), fields(ledger_id = %self.inner.ledger_id, len = data.len()))]
    pub async fn add_entry(&self, data: &[u8]) -> LedgerResult<i64> {
        self.add_entry_range(data, 0, data.len()).await
    }

    /// Appends `data[offset..offset + length]` and waits for its ack quorum.
    ///
    /// # Errors
    ///
    /// [`LedgerError::IndexOutOfBounds`] if the range does not fit in `data`,
    /// plus the errors of [`add_entry`](Self::add_entry).
    pub async fn add_entry_range(&self, data: &[u8], offset: usize, length: usize) -> LedgerResult<i64> {
        let (callback, rx) = completion::add_waiter();
        let _completion = self.async_add_entry(data, offset, length, Some(callback), None)?;
        completion::wait(rx).await
    }

    /// Appends `data[offset..offset + length]`, completing through `callback`.
    ///
    /// The entry id is consumed only once the range and callback are
    /// validated.
    ///
    /// # Errors
    ///
    /// Raised synchronously, before anything is dispatched:
    /// - [`LedgerError::IndexOutOfBounds`] if the range does not fit in `data`
    /// - [`LedgerError::InvalidArgument`] if `callback` is `None`
    ///
    /// Every other failure is delivered to the callback.
    pub fn async_add_entry(
        &self,
        data: &[u8],
        offset: usize,
        length: usize,
        callback: Option<Box<dyn AddCallback>>,
        ctx: CallbackContext,
    ) -> LedgerResult<Completion> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or(LedgerError::IndexOutOfBounds { offset, length, size: data.len() })?;
        let (pending, completion) = AddCompletion::new(callback, ctx)?;
        let payload = &data[offset..end];

        let mut state = self.inner.state.lock();
        if self.inner.mode == HandleMode::ReadOnly
            || state.status != HandleStatus::Open
            || state.metadata.value.is_closed()
        {
            drop(state);
            let err = self.closed_error();
            let handle = self.clone();
            self.inner.shared.executor.submit(self.inner.ledger_id, move || {
                handle.finish_adds(vec![(pending, Err(err), Duration::ZERO)]);
            });
            return Ok(completion);
        }

        let entry_id = state.last_add_pushed + 1;
        state.last_add_pushed = entry_id;
        state.pushed_length += payload.len() as u64;
        let frame =
            self.inner.digest.compute_digest_and_package(entry_id, state.lac, state.pushed_length, payload);
        let mut op = PendingAddOp::new(
            entry_id,
            frame.clone(),
            state.pushed_length,
            self.inner.schedule.ack_set(entry_id),
            pending,
        );
        let sends = if state.changing.is_none() {
            op.dispatch(state.metadata.value.ensemble_at(entry_id))
        } else {
            tracing::debug!(ledger_id = %self.inner.ledger_id, entry_id, "holding add until ensemble change completes");
            Vec::new()
        };
        state.pending_adds.push_back(op);
        self.publish_pending(&state);
        drop(state);

        self.send_add_requests(entry_id, frame, sends);
        Ok(completion)
    }

    fn send_add_requests(&self, entry_id: i64, frame: Bytes, sends: Vec<(usize, BookieId)>) {
        for (position, bookie) in sends {
            let handle = self.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                let outcome = ops::send_add(
                    &handle.inner.shared,
                    &bookie,
                    handle.inner.ledger_id,
                    entry_id,
                    &handle.inner.master_key,
                    frame,
                    WriteFlags::default(),
                )
                .await;
                let executor = handle.inner.shared.executor.clone();
                let ledger_id = handle.inner.ledger_id;
                executor.submit(ledger_id, move || handle.on_add_outcome(entry_id, position, &bookie, outcome));
            });
        }
    }

    fn on_add_outcome(&self, entry_id: i64, position: usize, bookie: &BookieId, outcome: NodeOutcome<()>) {
        let ledger_id = self.inner.ledger_id;
        let mut state = self.inner.state.lock();
        let Some(index) = state.pending_index(entry_id) else {
            return;
        };
        if !state.pending_adds[index].is_current_target(position, bookie) {
            tracing::debug!(ledger_id = %ledger_id, entry_id, bookie = %bookie, "ignoring response from replaced bookie");
            return;
        }

        match outcome {
            NodeOutcome::Success(()) => {
                if state.pending_adds[index].ack_set.complete_ack(position) {
                    let finished = self.drain_acked(&mut state);
                    drop(state);
                    self.finish_adds(finished);
                }
            },
            NodeOutcome::Failure(BookieError::Fenced { .. }) => {
                drop(state);
                tracing::warn!(ledger_id = %ledger_id, entry_id, bookie = %bookie, "ledger fenced by another client");
                self.fail_ledger(LedgerError::LedgerFenced { ledger_id });
            },
            NodeOutcome::Failure(BookieError::Unauthorized { .. }) => {
                drop(state);
                self.fail_ledger(LedgerError::UnauthorizedAccess { ledger_id });
            },
            failed => {
                tracing::warn!(
                    ledger_id = %ledger_id,
                    entry_id,
                    position,
                    bookie = %bookie,
                    outcome = ?failed,
                    "add to bookie failed"
                );
                self.on_bookie_failure(state, index, position, bookie);
            },
        }
    }

    /// Pops every add at the head of the queue that has its quorum.
    fn drain_acked(&self, state: &mut HandleState) -> Vec<FinishedAdd> {
        let mut finished = Vec::new();
        while state.pending_adds.front().is_some_and(|op| op.ack_set.has_quorum()) {
            let Some(mut op) = state.pending_adds.pop_front() else { break };
            state.lac = op.entry_id;
            state.length = op.ledger_length;
            if let Some(completion) = op.completion.take() {
                finished.push((completion, Ok(op.entry_id), op.started.elapsed()));
            }
        }
        if !finished.is_empty() {
            tracing::debug!(ledger_id = %self.inner.ledger_id, lac = state.lac, "last add confirmed advanced");
            self.publish_pending(state);
        }
        finished
    }

    fn finish_adds(&self, finished: Vec<FinishedAdd>) {
        let stats = &self.inner.shared.context.stats;
        for (completion, result, latency) in finished {
            stats.record_add(latency, result.is_ok());
            completion.complete(stats, self.inner.ledger_id, result);
        }
    }

    fn on_bookie_failure(
        &self,
        mut state: parking_lot::MutexGuard<'_, HandleState>,
        index: usize,
        position: usize,
        bookie: &BookieId,
    ) {
        let feasible = state.pending_adds[index].ack_set.fail(position);
        let entry_id = state.pending_adds[index].entry_id;
        let ledger_id = self.inner.ledger_id;
        let unreachable = || {
            LedgerError::not_enough_bookies(ledger_id, format!("ack quorum unreachable for entry {entry_id}"))
        };

        if !self.inner.shared.config.ensemble_change_enabled() {
            if !feasible {
                drop(state);
                self.fail_ledger(unreachable());
            }
            return;
        }

        state.failed_bookies.insert(bookie.clone());
        let replacing = state.changing.as_ref().map(|changing| changing.get(&position) == Some(bookie));
        if let Some(already_replacing) = replacing {
            if !already_replacing {
                state.delayed_failures.insert(position, bookie.clone());
            }
            return;
        }
        let in_ensemble = state.metadata.value.last_ensemble().1.get(position) == Some(bookie);
        if !in_ensemble || state.unreplaceable.contains(bookie) {
            if !feasible {
                drop(state);
                self.fail_ledger(unreachable());
            }
            return;
        }

        let failed = BTreeMap::from([(position, bookie.clone())]);
        state.changing = Some(failed.clone());
        drop(state);
        self.spawn_ensemble_change(failed);
    }

    fn spawn_ensemble_change(&self, failed: BTreeMap<usize, BookieId>) {
        let handle = self.clone();
        tokio::spawn(async move {
            let ledger_id = handle.inner.ledger_id;
            let executor = handle.inner.shared.executor.clone();
            match handle.change_ensemble(&failed).await {
                Ok((metadata, replaced)) => {
                    executor.submit(ledger_id, move || handle.apply_ensemble_change(metadata, &replaced));
                },
                Err(err @ LedgerError::NotEnoughBookies { .. }) => {
                    handle.inner.shared.context.stats.record_ensemble_change_failure();
                    tracing::warn!(
                        ledger_id = %ledger_id,
                        error = %err,
                        "no replacement bookie, writing to degraded ensemble"
                    );
                    executor.submit(ledger_id, move || handle.continue_degraded(&failed, err));
                },
                Err(err) => {
                    handle.inner.shared.context.stats.record_ensemble_change_failure();
                    tracing::error!(ledger_id = %ledger_id, error = %err, "ensemble change failed");
                    executor.submit(ledger_id, move || handle.fail_ledger(err));
                },
            }
        });
    }

    /// Picks replacements for `failed` and records the new ensemble from `LAC + 1`.
    async fn change_ensemble(
        &self,
        failed: &BTreeMap<usize, BookieId>,
    ) -> LedgerResult<(Versioned<LedgerMetadata>, BTreeMap<usize, BookieId>)> {
        let ledger_id = self.inner.ledger_id;
        let context = &self.inner.shared.context;
        let (mut current, boundary, excluded) = {
            let state = self.inner.state.lock();
            (state.metadata.clone(), state.lac + 1, state.failed_bookies.clone())
        };

        let mut conflicts = 0;
        loop {
            let mut ensemble = current.value.last_ensemble().1.to_vec();
            let mut replaced = BTreeMap::new();
            for (position, bookie) in failed {
                if ensemble.get(*position) != Some(bookie) {
                    continue;
                }
                let replacement = context
                    .placement
                    .replace_bookie(current.value.quorum, &current.value.custom_metadata, &ensemble, bookie, &excluded)
                    .map_err(|err| LedgerError::from_placement(ledger_id, err))?;
                ensemble[*position] = replacement.clone();
                replaced.insert(*position, replacement);
            }

            let mut updated = current.value.clone();
            updated.ensembles.insert(boundary, ensemble);
            match context.metadata_store.write_ledger_metadata(ledger_id, updated, current.version).await {
                Ok(written) => return Ok((written, replaced)),
                Err(MetadataError::BadVersion { .. })
                    if conflicts < self.inner.shared.config.metadata_conflict_retries() =>
                {
                    conflicts += 1;
                    let reread = context
                        .metadata_store
                        .read_ledger_metadata(ledger_id)
                        .await
                        .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;
                    if reread.value.state != LedgerState::Open {
                        return Err(LedgerError::LedgerFenced { ledger_id });
                    }
                    current = reread;
                },
                Err(err) => return Err(LedgerError::from_metadata(ledger_id, err)),
            }
        }
    }

    fn apply_ensemble_change(&self, metadata: Versioned<LedgerMetadata>, replaced: &BTreeMap<usize, BookieId>) {
        let ledger_id = self.inner.ledger_id;
        let mut state = self.inner.state.lock();
        if state.status == HandleStatus::Closed {
            return;
        }
        state.metadata = metadata;
        state.changing = None;
        let ensemble = state.metadata.value.last_ensemble().1.to_vec();

        let mut sends = Vec::new();
        for op in &mut state.pending_adds {
            if op.is_dispatched() {
                let targets: Vec<(usize, BookieId)> = replaced
                    .iter()
                    .filter(|(position, bookie)| op.replace(**position, bookie))
                    .map(|(position, bookie)| (*position, bookie.clone()))
                    .collect();
                if !targets.is_empty() {
                    sends.push((op.entry_id, op.frame.clone(), targets));
                }
            } else {
                let targets = op.dispatch(&ensemble);
                sends.push((op.entry_id, op.frame.clone(), targets));
            }
        }

        let delayed: BTreeMap<usize, BookieId> = std::mem::take(&mut state.delayed_failures)
            .into_iter()
            .filter(|(position, bookie)| ensemble.get(*position) == Some(bookie))
            .collect();
        if !delayed.is_empty() {
            state.changing = Some(delayed.clone());
        }
        drop(state);

        self.inner.shared.context.stats.record_ensemble_change();
        tracing::warn!(
            ledger_id = %ledger_id,
            replaced = ?replaced,
            resent = sends.len(),
            "ensemble changed"
        );
        for (entry_id, frame, targets) in sends {
            self.send_add_requests(entry_id, frame, targets);
        }
        if !delayed.is_empty() {
            self.spawn_ensemble_change(delayed);
        }
    }

    /// Keeps the current ensemble after a failed replacement.
    ///
    /// Held adds are dispatched to the degraded ensemble. The ledger fails
    /// with `err` only if some dispatched add can no longer reach its ack
    /// quorum.
    fn continue_degraded(&self, failed: &BTreeMap<usize, BookieId>, err: LedgerError) {
        let mut state = self.inner.state.lock();
        if state.status == HandleStatus::Closed {
            return;
        }
        state.changing = None;
        let delayed = std::mem::take(&mut state.delayed_failures);
        state.unreplaceable.extend(failed.values().chain(delayed.values()).cloned());
        if state.pending_adds.iter().any(|op| op.is_dispatched() && !op.ack_set.is_feasible()) {
            drop(state);
            self.fail_ledger(err);
            return;
        }

        let ensemble = state.metadata.value.last_ensemble().1.to_vec();
        let sends: Vec<_> = state
            .pending_adds
            .iter_mut()
            .filter(|op| !op.is_dispatched())
            .map(|op| {
                let targets = op.dispatch(&ensemble);
                (op.entry_id, op.frame.clone(), targets)
            })
            .collect();
        drop(state);

        for (entry_id, frame, targets) in sends {
            self.send_add_requests(entry_id, frame, targets);
        }
    }

    /// Fails every pending add with `err` and closes the handle.
    fn fail_ledger(&self, err: LedgerError) {
        let ledger_id = self.inner.ledger_id;
        let mut state = self.inner.state.lock();
        if state.status == HandleStatus::Closed && state.pending_adds.is_empty() {
            return;
        }
        let was_open = state.status == HandleStatus::Open;
        state.status = HandleStatus::Closed;
        state.fenced |= matches!(err, LedgerError::LedgerFenced { .. });
        state.changing = None;
        state.delayed_failures.clear();
        let finished: Vec<FinishedAdd> = state
            .pending_adds
            .drain(..)
            .filter_map(|mut op| {
                let latency = op.started.elapsed();
                op.completion.take().map(|completion| (completion, Err(err.clone()), latency))
            })
            .collect();
        self.publish_pending(&state);
        let lac = state.lac;
        drop(state);

        tracing::error!(ledger_id = %ledger_id, error = %err, failed_adds = finished.len(), lac, "ledger write failed");
        self.finish_adds(finished);

        if was_open {
            let handle = self.clone();
            tokio::spawn(async move {
                if let Err(err) = handle.seal_once().await {
                    tracing::warn!(ledger_id = %ledger_id, error = %err, "could not seal ledger after failure");
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Reads entries `first..=last`, all at or below the last-add-confirmed.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::IncorrectParameter`] if `first < 0` or `first > last`
    /// - [`LedgerError::Read`] if `last` is beyond the last-add-confirmed, or an entry cannot be read
    /// - [`LedgerError::BookieUnavailable`] if every bookie holding an entry is unreachable
    /// - [`LedgerError::DigestMismatch`] if no copy of an entry verifies
    #[tracing::instrument(skip(self), fields(ledger_id = %self.inner.ledger_id))]
    pub async fn read_entries(&self, first: i64, last: i64) -> LedgerResult<Vec<LedgerEntry>> {
        let (callback, rx) = completion::read_waiter();
        let _completion = self.async_read_entries(first, last, Some(callback), None)?;
        completion::wait(rx).await
    }

    /// Reads entries `first..=last`, completing through `callback`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidArgument`] if `callback` is `None`; every other
    /// failure is delivered to the callback.
    pub fn async_read_entries(
        &self,
        first: i64,
        last: i64,
        callback: Option<Box<dyn ReadCallback>>,
        ctx: CallbackContext,
    ) -> LedgerResult<Completion> {
        self.spawn_read(callback, ctx, move |handle| async move { handle.read_range(first, last, true).await })
    }

    /// Reads entries `first..=last` without bounding them by the last-add-confirmed.
    ///
    /// Entries past the last-add-confirmed may not have reached an ack
    /// quorum yet and may never do so.
    ///
    /// # Errors
    ///
    /// As [`read_entries`](Self::read_entries), except that an entry missing
    /// from enough bookies fails with [`LedgerError::NoSuchEntry`], and a
    /// range longer than
    /// [`max_unconfirmed_read_entries`](crate::ClientConfig::max_unconfirmed_read_entries)
    /// fails with [`LedgerError::IncorrectParameter`].
    pub async fn read_unconfirmed_entries(&self, first: i64, last: i64) -> LedgerResult<Vec<LedgerEntry>> {
        let (callback, rx) = completion::read_waiter();
        let _completion = self.spawn_read(Some(callback), None, move |handle| async move {
            handle.read_range(first, last, false).await
        })?;
        completion::wait(rx).await
    }

    /// Reads up to `max_count` entries from `start`, within `max_size` payload bytes.
    ///
    /// A `max_size` of zero, or one above the configured maximum frame size,
    /// is treated as the maximum frame size. The first entry is returned
    /// even if it alone exceeds the budget.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::IncorrectParameter`] if `max_count` is zero
    /// - [`LedgerError::Read`] if `start` is negative or beyond the last-add-confirmed
    /// - the errors of [`read_entries`](Self::read_entries)
    #[tracing::instrument(skip(self), fields(ledger_id = %self.inner.ledger_id))]
    pub async fn batch_read_entries(
        &self,
        start: i64,
        max_count: usize,
        max_size: usize,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let (callback, rx) = completion::read_waiter();
        let _completion = self.async_batch_read_entries(start, max_count, max_size, Some(callback), None)?;
        completion::wait(rx).await
    }

    /// Batch read completing through `callback`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidArgument`] if `callback` is `None`; every other
    /// failure is delivered to the callback.
    pub fn async_batch_read_entries(
        &self,
        start: i64,
        max_count: usize,
        max_size: usize,
        callback: Option<Box<dyn ReadCallback>>,
        ctx: CallbackContext,
    ) -> LedgerResult<Completion> {
        self.spawn_read(callback, ctx, move |handle| async move {
            let result = handle.batch_read(start, max_count, max_size).await;
            handle.inner.shared.context.stats.record_batch_read(result.is_ok());
            result
        })
    }

    fn spawn_read<F, Fut>(
        &self,
        callback: Option<Box<dyn ReadCallback>>,
        ctx: CallbackContext,
        read: F,
    ) -> LedgerResult<Completion>
    where
        F: FnOnce(LedgerHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = LedgerResult<Vec<LedgerEntry>>> + Send + 'static,
    {
        let (pending, completion) = ReadCompletion::new(callback, ctx)?;
        let handle = self.clone();
        tokio::spawn(async move {
            let result = read(handle.clone()).await;
            let ledger_id = handle.inner.ledger_id;
            let executor = handle.inner.shared.executor.clone();
            executor.submit(ledger_id, move || {
                pending.complete(&handle.inner.shared.context.stats, ledger_id, result);
            });
        });
        Ok(completion)
    }

    fn check_readable(&self, state: &HandleState) -> LedgerResult<()> {
        if state.close_requested {
            return Err(self.closed_error());
        }
        Ok(())
    }

    pub(crate) fn read_request(&self, metadata: &LedgerMetadata, entry_id: i64) -> ReadEntryRequest {
        let ensemble = metadata.ensemble_at(entry_id);
        let candidates = self
            .inner
            .schedule
            .write_set(entry_id)
            .into_iter()
            .filter_map(|position| ensemble.get(position).cloned())
            .collect();
        ReadEntryRequest::new(
            self.inner.ledger_id,
            entry_id,
            candidates,
            self.inner.schedule.quorum().tolerated_failures() + 1,
        )
    }

    async fn read_range(&self, first: i64, last: i64, confirmed: bool) -> LedgerResult<Vec<LedgerEntry>> {
        let ledger_id = self.inner.ledger_id;
        if first < 0 || first > last {
            return Err(LedgerError::incorrect_parameter(format!("invalid entry range [{first}, {last}]")));
        }
        let max_entries = self.inner.shared.config.max_unconfirmed_read_entries();
        let span = u64::try_from(last - first).unwrap_or(u64::MAX);
        if !confirmed && span >= max_entries as u64 {
            return Err(LedgerError::incorrect_parameter(format!(
                "entry range [{first}, {last}] exceeds {max_entries} entries"
            )));
        }
        let requests = {
            let state = self.inner.state.lock();
            self.check_readable(&state)?;
            if confirmed && last > state.lac {
                return Err(LedgerError::read(
                    ledger_id,
                    format!("entry {last} is beyond last add confirmed {}", state.lac),
                ));
            }
            (first..=last).map(|entry_id| self.read_request(&state.metadata.value, entry_id)).collect()
        };

        let started = Instant::now();
        let result = read::read_range(&self.inner.shared, &self.inner.digest, requests).await;
        self.inner.shared.context.stats.record_read(started.elapsed(), result.is_ok());
        if confirmed {
            result.map_err(|err| confirmed_read_error(ledger_id, err))
        } else {
            result
        }
    }

    async fn batch_read(&self, start: i64, max_count: usize, max_size: usize) -> LedgerResult<Vec<LedgerEntry>> {
        let ledger_id = self.inner.ledger_id;
        if max_count == 0 {
            return Err(LedgerError::incorrect_parameter("max_count must be positive"));
        }
        let max_frame_size = self.inner.shared.config.max_frame_size();
        let budget = if max_size == 0 || max_size > max_frame_size { max_frame_size } else { max_size };

        enum Plan {
            SingleBookie(BatchReadOp),
            PerEntry(Vec<ReadEntryRequest>),
        }
        let plan = {
            let state = self.inner.state.lock();
            self.check_readable(&state)?;
            if start < 0 || start > state.lac {
                return Err(LedgerError::read(
                    ledger_id,
                    format!("batch start {start} is outside [0, {}]", state.lac),
                ));
            }
            let available = usize::try_from(state.lac - start + 1).unwrap_or(usize::MAX);
            let mut count = max_count.min(available);
            let metadata = &state.metadata.value;
            if let Some((next_boundary, _)) = metadata.ensembles.range(start + 1..).next() {
                count = count.min(usize::try_from(next_boundary - start).unwrap_or(usize::MAX));
            }

            if self.inner.schedule.is_fully_replicated() {
                let candidates = self.read_request(metadata, start).candidates().to_vec();
                Plan::SingleBookie(BatchReadOp::new(ledger_id, start, count, budget, candidates))
            } else {
                let last = start + i64::try_from(count).unwrap_or(i64::MAX) - 1;
                Plan::PerEntry((start..=last).map(|entry_id| self.read_request(metadata, entry_id)).collect())
            }
        };

        let result = match plan {
            Plan::SingleBookie(op) => batch_read::batch_read(&self.inner.shared, &self.inner.digest, op).await,
            Plan::PerEntry(requests) => read::read_range(&self.inner.shared, &self.inner.digest, requests)
                .await
                .map(|entries| batch_read::trim_to_budget(entries, budget)),
        };
        result.map_err(|err| confirmed_read_error(ledger_id, err))
    }

    // ------------------------------------------------------------------
    // Last add confirmed
    // ------------------------------------------------------------------

    /// Returns the last-add-confirmed, asking the ensemble when it is not known locally.
    ///
    /// A writer, or a handle on a sealed ledger, answers from its own state.
    /// Otherwise the answer is trusted only once enough bookies responded to
    /// cover every write set; a higher discovered value advances the local one.
    ///
    /// # Errors
    ///
    /// [`LedgerError::BookieUnavailable`] or [`LedgerError::Read`] when too
    /// many bookies fail to answer.
    #[tracing::instrument(skip(self), fields(ledger_id = %self.inner.ledger_id))]
    pub async fn read_last_confirmed(&self) -> LedgerResult<i64> {
        let (callback, rx) = completion::last_confirmed_waiter();
        let _completion = self.async_read_last_confirmed(Some(callback), None)?;
        completion::wait(rx).await
    }

    /// [`read_last_confirmed`](Self::read_last_confirmed), completing through `callback`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidArgument`] if `callback` is `None`.
    pub fn async_read_last_confirmed(
        &self,
        callback: Option<Box<dyn LastConfirmedCallback>>,
        ctx: CallbackContext,
    ) -> LedgerResult<Completion> {
        self.spawn_last_confirmed(callback, ctx, LacMode::Covered)
    }

    /// Like [`read_last_confirmed`](Self::read_last_confirmed), but completes on
    /// the first verified response instead of waiting for coverage.
    ///
    /// The answer may lag behind the true last-add-confirmed.
    ///
    /// # Errors
    ///
    /// As [`read_last_confirmed`](Self::read_last_confirmed).
    pub async fn try_read_last_confirmed(&self) -> LedgerResult<i64> {
        let (callback, rx) = completion::last_confirmed_waiter();
        let _completion = self.async_try_read_last_confirmed(Some(callback), None)?;
        completion::wait(rx).await
    }

    /// [`try_read_last_confirmed`](Self::try_read_last_confirmed), completing through `callback`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidArgument`] if `callback` is `None`.
    pub fn async_try_read_last_confirmed(
        &self,
        callback: Option<Box<dyn LastConfirmedCallback>>,
        ctx: CallbackContext,
    ) -> LedgerResult<Completion> {
        self.spawn_last_confirmed(callback, ctx, LacMode::FirstResponse)
    }

    fn spawn_last_confirmed(
        &self,
        callback: Option<Box<dyn LastConfirmedCallback>>,
        ctx: CallbackContext,
        mode: LacMode,
    ) -> LedgerResult<Completion> {
        let (pending, completion) = LastConfirmedCompletion::new(callback, ctx)?;
        let handle = self.clone();
        tokio::spawn(async move {
            let result = handle.discover_last_confirmed(mode).await;
            let ledger_id = handle.inner.ledger_id;
            let executor = handle.inner.shared.executor.clone();
            executor.submit(ledger_id, move || {
                pending.complete(&handle.inner.shared.context.stats, ledger_id, result);
            });
        });
        Ok(completion)
    }

    async fn discover_last_confirmed(&self, mode: LacMode) -> LedgerResult<i64> {
        let ensemble = {
            let state = self.inner.state.lock();
            self.check_readable(&state)?;
            if self.inner.mode == HandleMode::Writable || state.metadata.value.is_closed() {
                return Ok(state.lac);
            }
            state.metadata.value.last_ensemble().1.to_vec()
        };
        let op = ReadLastConfirmedOp::new(self.inner.ledger_id, &self.inner.schedule, mode);
        let discovered =
            read_lac::read_last_confirmed(&self.inner.shared, &self.inner.digest, &ensemble, ReadFlags::Normal, op)
                .await?;
        Ok(self.advance_last_confirmed(discovered))
    }

    /// Moves the local last-add-confirmed forward to `discovered`, never back.
    pub(crate) fn advance_last_confirmed(&self, discovered: i64) -> i64 {
        let mut state = self.inner.state.lock();
        let advanced = discovered > state.lac;
        if advanced {
            state.lac = discovered;
            state.last_add_pushed = state.last_add_pushed.max(discovered);
        }
        self.inner.shared.context.stats.record_lac_update(advanced);
        state.lac
    }

    /// Reads the entry at the last-add-confirmed.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NoSuchEntry`] if the ledger is empty, plus the errors of
    /// [`read_last_confirmed`](Self::read_last_confirmed) and
    /// [`read_entries`](Self::read_entries).
    pub async fn read_last_entry(&self) -> LedgerResult<LedgerEntry> {
        let ledger_id = self.inner.ledger_id;
        let lac = self.read_last_confirmed().await?;
        if lac < 0 {
            return Err(LedgerError::NoSuchEntry { ledger_id, entry_id: lac });
        }
        self.read_entries(lac, lac)
            .await?
            .pop()
            .ok_or(LedgerError::NoSuchEntry { ledger_id, entry_id: lac })
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Seals the handle.
    ///
    /// New operations fail with [`LedgerError::LedgerClosed`] as soon as close
    /// begins. In-flight adds are allowed to finish; then the writer records
    /// the ledger as closed at its last-add-confirmed. Idempotent: every call
    /// returns the outcome of the first.
    ///
    /// # Errors
    ///
    /// [`LedgerError::MetadataVersion`] or [`LedgerError::LedgerFenced`] if the
    /// metadata changed underneath the writer.
    #[tracing::instrument(skip(self), fields(ledger_id = %self.inner.ledger_id))]
    pub async fn close(&self) -> LedgerResult<()> {
        self.inner.state.lock().close_requested = true;
        self.seal_once().await
    }

    async fn seal_once(&self) -> LedgerResult<()> {
        self.inner.closed.get_or_init(|| self.seal()).await.clone()
    }

    async fn seal(&self) -> LedgerResult<()> {
        let ledger_id = self.inner.ledger_id;
        {
            let mut state = self.inner.state.lock();
            if state.status == HandleStatus::Open {
                state.status = HandleStatus::Closing;
            }
        }
        let mut pending = self.inner.pending.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;

        let (current, lac, length, fenced) = {
            let mut state = self.inner.state.lock();
            state.status = HandleStatus::Closed;
            (state.metadata.clone(), state.lac, state.length, state.fenced)
        };

        fail_point!("ledger-close-before-metadata", |_| {
            Err(LedgerError::unexpected_condition("injected failure before sealing metadata"))
        });

        if self.inner.mode == HandleMode::ReadOnly || fenced || current.value.is_closed() {
            return Ok(());
        }
        let sealed = self.write_closed_metadata(current, lac, length).await?;
        self.install_metadata(sealed);
        tracing::info!(ledger_id = %ledger_id, lac, length, "ledger closed");
        Ok(())
    }

    async fn write_closed_metadata(
        &self,
        mut current: Versioned<LedgerMetadata>,
        lac: i64,
        length: u64,
    ) -> LedgerResult<Versioned<LedgerMetadata>> {
        let ledger_id = self.inner.ledger_id;
        let store = &self.inner.shared.context.metadata_store;
        let mut conflicts = 0;
        loop {
            let mut closed = current.value.clone();
            closed.state = LedgerState::Closed;
            closed.last_entry_id = lac;
            closed.length = length;
            match store.write_ledger_metadata(ledger_id, closed, current.version).await {
                Ok(written) => return Ok(written),
                Err(MetadataError::BadVersion { .. })
                    if conflicts < self.inner.shared.config.metadata_conflict_retries() =>
                {
                    conflicts += 1;
                    let reread = store
                        .read_ledger_metadata(ledger_id)
                        .await
                        .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;
                    match reread.value.state {
                        LedgerState::Open => current = reread,
                        LedgerState::Closed
                            if reread.value.last_entry_id == lac && reread.value.length == length =>
                        {
                            return Ok(reread);
                        },
                        LedgerState::Closed => return Err(LedgerError::MetadataVersion { ledger_id }),
                        LedgerState::InRecovery => return Err(LedgerError::LedgerFenced { ledger_id }),
                    }
                },
                Err(err) => return Err(LedgerError::from_metadata(ledger_id, err)),
            }
        }
    }
}

/// Within the confirmed range an entry cannot be legitimately absent.
fn confirmed_read_error(ledger_id: LedgerId, err: LedgerError) -> LedgerError {
    match err {
        LedgerError::NoSuchEntry { entry_id, .. } => {
            LedgerError::read(ledger_id, format!("confirmed entry {entry_id} missing from every bookie"))
        },
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testutil::{options, TestCluster};

    #[test]
    fn confirmed_reads_never_report_missing_entries() {
        let ledger_id = LedgerId::from(3);
        let mapped = confirmed_read_error(ledger_id, LedgerError::NoSuchEntry { ledger_id, entry_id: 4 });
        assert!(matches!(mapped, LedgerError::Read { .. }));
        let untouched = confirmed_read_error(ledger_id, LedgerError::BookieUnavailable { ledger_id });
        assert!(matches!(untouched, LedgerError::BookieUnavailable { .. }));
    }

    #[tokio::test]
    async fn pending_index_follows_queue_front() {
        let cluster = TestCluster::new(3);
        let handle = cluster.client().create_ledger(options(3, 2, 2)).await.expect("create");
        let schedule = *handle.schedule();

        let mut state = handle.inner.state.lock();
        for entry_id in 5..8 {
            let (pending, _completion) =
                AddCompletion::new(Some(completion::add_waiter().0), None).expect("callback");
            state.pending_adds.push_back(PendingAddOp::new(
                entry_id,
                Bytes::new(),
                0,
                schedule.ack_set(entry_id),
                pending,
            ));
        }
        assert_eq!(state.pending_index(5), Some(0));
        assert_eq!(state.pending_index(7), Some(2));
        assert_eq!(state.pending_index(4), None);
        assert_eq!(state.pending_index(8), None);
        state.pending_adds.clear();
    }

    #[tokio::test]
    async fn lac_only_moves_forward() {
        let cluster = TestCluster::new(3);
        let client = cluster.client();
        let writer = client.create_ledger(options(3, 2, 2)).await.expect("create");
        let reader = client.open_ledger_no_recovery(writer.id(), DigestType::Crc32, b"pw").await.expect("open");

        let before = cluster.stats.snapshot();
        assert_eq!(reader.advance_last_confirmed(4), 4);
        assert_eq!(reader.advance_last_confirmed(2), 4);
        assert_eq!(reader.last_add_pushed(), 4);
        let after = cluster.stats.snapshot();
        assert_eq!(after.lac_update_hits - before.lac_update_hits, 1);
        assert_eq!(after.lac_update_misses - before.lac_update_misses, 1);
    }
}
