//! Ledger recovery.
//!
//! Opening a ledger that is still open for writing seals it on the writer's
//! behalf:
//!
//! 1. the metadata is marked in recovery, so the writer's close fails;
//! 2. every bookie of the last ensemble is fenced, so the writer's adds fail;
//! 3. entries past the last-add-confirmed are read back one by one and
//!    rewritten to an ack quorum, until one is missing;
//! 4. the ledger is recorded as closed at the last recovered entry.
//!
//! Entries acknowledged to the writer are always recovered. An entry the
//! writer never saw acknowledged may or may not survive.

use std::sync::Arc;

use quorumlog_cluster::{
    LedgerMetadata, LedgerState, MetadataError, NodeOutcome, ReadFlags, Versioned, WriteFlags, INVALID_ENTRY_ID,
};
use tokio::task::JoinSet;

use crate::{
    entry::LedgerEntry,
    error::{LedgerError, LedgerResult},
    handle::LedgerHandle,
    ops::{
        self, read,
        read_lac::{self, LacMode, ReadLastConfirmedOp},
    },
};

/// Fences, completes and seals the ledger behind `handle`.
#[tracing::instrument(skip(handle), fields(ledger_id = %handle.id()))]
pub(crate) async fn recover(handle: &LedgerHandle) -> LedgerResult<()> {
    let ledger_id = handle.id();
    let Some(metadata) = mark_in_recovery(handle).await? else {
        tracing::debug!(ledger_id = %ledger_id, "ledger closed by another client, nothing to recover");
        return Ok(());
    };
    handle.install_metadata(metadata.clone());

    let (boundary, ensemble) = {
        let (boundary, ensemble) = metadata.value.last_ensemble();
        (boundary, ensemble.to_vec())
    };
    let fence = ReadFlags::Fence { master_key: handle.master_key().clone() };
    let op = ReadLastConfirmedOp::new(ledger_id, handle.schedule(), LacMode::Covered);
    let fenced_lac =
        read_lac::read_last_confirmed(handle.shared(), handle.digest(), &ensemble, fence, op).await?;

    // Everything before the last ensemble was confirmed when it was replaced.
    let mut lac = fenced_lac.max(boundary - 1);
    let mut length = if lac == INVALID_ENTRY_ID {
        0
    } else {
        read_unconfirmed(handle, &metadata.value, lac).await?.ledger_length()
    };
    tracing::info!(ledger_id = %ledger_id, lac, "ledger fenced, recovering unconfirmed entries");

    loop {
        let entry_id = lac + 1;
        match read_unconfirmed(handle, &metadata.value, entry_id).await {
            Ok(entry) => {
                replicate(handle, &metadata.value, lac, &entry).await?;
                lac = entry_id;
                length = entry.ledger_length();
            },
            Err(LedgerError::NoSuchEntry { .. }) => break,
            Err(err) => return Err(err),
        }
    }

    let sealed = write_closed(handle, metadata, lac, length).await?;
    let (lac, length) = (sealed.value.last_entry_id, sealed.value.length);
    handle.install_metadata(sealed);
    handle.shared().context.stats.record_recovery();
    tracing::info!(ledger_id = %ledger_id, lac, length, "ledger recovered");
    Ok(())
}

/// Moves the metadata from `Open` to `InRecovery`.
///
/// Returns `None` when the ledger turns out to be closed already.
async fn mark_in_recovery(handle: &LedgerHandle) -> LedgerResult<Option<Versioned<LedgerMetadata>>> {
    let ledger_id = handle.id();
    let shared = handle.shared();
    let store = &shared.context.metadata_store;
    let mut current = handle.versioned_metadata();
    let mut conflicts = 0;
    loop {
        match current.value.state {
            LedgerState::Closed => {
                handle.install_metadata(current);
                return Ok(None);
            },
            LedgerState::InRecovery => return Ok(Some(current)),
            LedgerState::Open => {},
        }
        let mut updated = current.value.clone();
        updated.state = LedgerState::InRecovery;
        match store.write_ledger_metadata(ledger_id, updated, current.version).await {
            Ok(written) => return Ok(Some(written)),
            Err(MetadataError::BadVersion { .. }) if conflicts < shared.config.metadata_conflict_retries() => {
                conflicts += 1;
                current = store
                    .read_ledger_metadata(ledger_id)
                    .await
                    .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;
            },
            Err(err) => return Err(LedgerError::from_metadata(ledger_id, err)),
        }
    }
}

async fn read_unconfirmed(handle: &LedgerHandle, metadata: &LedgerMetadata, entry_id: i64) -> LedgerResult<LedgerEntry> {
    let request = handle.read_request(metadata, entry_id);
    read::read_entry(Arc::clone(handle.shared()), Arc::clone(handle.digest()), request).await
}

/// Rewrites `entry` to its write set until an ack quorum holds it.
async fn replicate(handle: &LedgerHandle, metadata: &LedgerMetadata, lac: i64, entry: &LedgerEntry) -> LedgerResult<()> {
    let ledger_id = handle.id();
    let entry_id = entry.entry_id();
    let frame = handle.digest().compute_digest_and_package(entry_id, lac, entry.ledger_length(), entry.payload());
    let ensemble = metadata.ensemble_at(entry_id);
    let mut ack_set = handle.schedule().ack_set(entry_id);

    let mut sends = JoinSet::new();
    for &position in ack_set.write_set() {
        let Some(bookie) = ensemble.get(position).cloned() else { continue };
        let shared = Arc::clone(handle.shared());
        let master_key = handle.master_key().clone();
        let frame = frame.clone();
        sends.spawn(async move {
            let outcome =
                ops::send_add(&shared, &bookie, ledger_id, entry_id, &master_key, frame, WriteFlags::recovery()).await;
            (position, bookie, outcome)
        });
    }

    while let Some(joined) = sends.join_next().await {
        let (position, bookie, outcome) =
            joined.map_err(|err| LedgerError::unexpected_condition(format!("recovery add task failed: {err}")))?;
        match outcome {
            NodeOutcome::Success(()) => {
                if ack_set.complete_ack(position) {
                    // Let the remaining copies land in the background.
                    sends.detach_all();
                    tracing::debug!(ledger_id = %ledger_id, entry_id, "recovered entry");
                    return Ok(());
                }
            },
            failed => {
                tracing::warn!(
                    ledger_id = %ledger_id,
                    entry_id,
                    bookie = %bookie,
                    outcome = ?failed,
                    "recovery add failed"
                );
                if !ack_set.fail(position) {
                    break;
                }
            },
        }
    }
    Err(LedgerError::not_enough_bookies(ledger_id, format!("could not re-replicate entry {entry_id} during recovery")))
}

/// Records the ledger as closed at `lac`, deferring to a close that got there first.
async fn write_closed(
    handle: &LedgerHandle,
    mut current: Versioned<LedgerMetadata>,
    lac: i64,
    length: u64,
) -> LedgerResult<Versioned<LedgerMetadata>> {
    let ledger_id = handle.id();
    let shared = handle.shared();
    let store = &shared.context.metadata_store;
    let mut conflicts = 0;
    loop {
        if current.value.is_closed() {
            return Ok(current);
        }
        let mut closed = current.value.clone();
        closed.state = LedgerState::Closed;
        closed.last_entry_id = lac;
        closed.length = length;
        match store.write_ledger_metadata(ledger_id, closed, current.version).await {
            Ok(written) => return Ok(written),
            Err(MetadataError::BadVersion { .. }) if conflicts < shared.config.metadata_conflict_retries() => {
                conflicts += 1;
                current = store
                    .read_ledger_metadata(ledger_id)
                    .await
                    .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;
            },
            Err(err) => return Err(LedgerError::from_metadata(ledger_id, err)),
        }
    }
}
