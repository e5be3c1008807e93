//! In-memory bookies and metadata store.
//!
//! [`MemoryBookieCluster`] implements [`BookieClient`] for a set of simulated
//! bookies living in one process, and [`MemoryMetadataStore`] implements
//! [`LedgerMetadataStore`] over a versioned map. Together they stand in for
//! a real cluster in tests and local development.
//!
//! # Fault injection
//!
//! Each simulated bookie can be:
//!
//! - killed and restarted ([`kill_bookie`](MemoryBookieCluster::kill_bookie),
//!   [`restart_bookie`](MemoryBookieCluster::restart_bookie)); data survives a restart
//! - slowed down ([`set_response_delay`](MemoryBookieCluster::set_response_delay))
//! - hung so it never answers ([`hang_bookie`](MemoryBookieCluster::hang_bookie))
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use quorumlog_cluster::{BookieClient, BookieId, LedgerId, MemoryBookieCluster, WriteFlags};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = MemoryBookieCluster::with_bookies(3);
//!     let bookie = BookieId::from("bookie-0");
//!     cluster
//!         .add_entry(&bookie, LedgerId::from(1), 0, b"key", Bytes::from("e0"), WriteFlags::default())
//!         .await
//!         .unwrap();
//!     assert_eq!(cluster.entry_count(&bookie, LedgerId::from(1)), 1);
//! }
//! ```

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    bookie::{BookieClient, ReadFlags, WriteFlags},
    error::{BookieError, BookieResult, MetadataError, MetadataResult},
    metadata::{LedgerMetadata, LedgerMetadataStore, Versioned},
    types::{BookieId, LedgerId},
};

#[derive(Debug, Default)]
struct StoredLedger {
    master_key: Bytes,
    fenced: bool,
    entries: BTreeMap<i64, Bytes>,
}

#[derive(Debug, Default)]
struct SimulatedBookie {
    available: bool,
    read_only: bool,
    hung: bool,
    delay: Duration,
    ledgers: HashMap<LedgerId, StoredLedger>,
}

impl SimulatedBookie {
    fn running() -> Self {
        Self { available: true, ..Self::default() }
    }
}

/// A set of simulated bookies reachable through [`BookieClient`].
///
/// # Cloning
///
/// Cheaply cloneable via [`Arc`]; all clones share the same bookies.
#[derive(Clone, Debug, Default)]
pub struct MemoryBookieCluster {
    bookies: Arc<RwLock<BTreeMap<BookieId, SimulatedBookie>>>,
}

impl MemoryBookieCluster {
    /// Creates an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cluster of `count` running bookies named `bookie-0`, `bookie-1`, ...
    pub fn with_bookies(count: usize) -> Self {
        let cluster = Self::new();
        for i in 0..count {
            cluster.add_bookie(BookieId::new(format!("bookie-{i}")));
        }
        cluster
    }

    /// Starts a new, empty bookie.
    pub fn add_bookie(&self, bookie: BookieId) {
        self.bookies.write().insert(bookie, SimulatedBookie::running());
    }

    /// Returns every bookie id, running or not.
    #[must_use]
    pub fn bookie_ids(&self) -> Vec<BookieId> {
        self.bookies.read().keys().cloned().collect()
    }

    /// Returns the running bookies that accept writes.
    #[must_use]
    pub fn writable_bookies(&self) -> BTreeSet<BookieId> {
        self.bookies
            .read()
            .iter()
            .filter(|(_, state)| state.available && !state.read_only)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the running bookies that only serve reads.
    #[must_use]
    pub fn read_only_bookies(&self) -> BTreeSet<BookieId> {
        self.bookies
            .read()
            .iter()
            .filter(|(_, state)| state.available && state.read_only)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Stops a bookie; every request to it fails with
    /// [`BookieError::Unavailable`] until it is restarted.
    pub fn kill_bookie(&self, bookie: &BookieId) {
        if let Some(state) = self.bookies.write().get_mut(bookie) {
            state.available = false;
            tracing::info!(bookie = %bookie, "simulated bookie stopped");
        }
    }

    /// Restarts a stopped or hung bookie, keeping its data.
    pub fn restart_bookie(&self, bookie: &BookieId) {
        if let Some(state) = self.bookies.write().get_mut(bookie) {
            state.available = true;
            state.hung = false;
            tracing::info!(bookie = %bookie, "simulated bookie restarted");
        }
    }

    /// Makes a bookie reject adds while still serving reads.
    pub fn set_read_only(&self, bookie: &BookieId, read_only: bool) {
        if let Some(state) = self.bookies.write().get_mut(bookie) {
            state.read_only = read_only;
        }
    }

    /// Delays every response of a bookie.
    pub fn set_response_delay(&self, bookie: &BookieId, delay: Duration) {
        if let Some(state) = self.bookies.write().get_mut(bookie) {
            state.delay = delay;
        }
    }

    /// Makes a bookie accept requests but never answer them.
    pub fn hang_bookie(&self, bookie: &BookieId) {
        if let Some(state) = self.bookies.write().get_mut(bookie) {
            state.hung = true;
        }
    }

    /// Number of entries a bookie stores for a ledger.
    #[must_use]
    pub fn entry_count(&self, bookie: &BookieId, ledger_id: LedgerId) -> usize {
        self.bookies
            .read()
            .get(bookie)
            .and_then(|state| state.ledgers.get(&ledger_id))
            .map_or(0, |ledger| ledger.entries.len())
    }

    /// Returns `true` if the bookie has fenced the ledger.
    #[must_use]
    pub fn is_fenced(&self, bookie: &BookieId, ledger_id: LedgerId) -> bool {
        self.bookies
            .read()
            .get(bookie)
            .and_then(|state| state.ledgers.get(&ledger_id))
            .is_some_and(|ledger| ledger.fenced)
    }

    /// Removes a stored entry, simulating data loss on one bookie.
    pub fn drop_entry(&self, bookie: &BookieId, ledger_id: LedgerId, entry_id: i64) {
        if let Some(ledger) =
            self.bookies.write().get_mut(bookie).and_then(|state| state.ledgers.get_mut(&ledger_id))
        {
            ledger.entries.remove(&entry_id);
        }
    }

    /// Overwrites a stored frame, simulating corruption on one bookie.
    pub fn corrupt_entry(&self, bookie: &BookieId, ledger_id: LedgerId, entry_id: i64) {
        if let Some(frame) = self
            .bookies
            .write()
            .get_mut(bookie)
            .and_then(|state| state.ledgers.get_mut(&ledger_id))
            .and_then(|ledger| ledger.entries.get_mut(&entry_id))
        {
            let mut corrupted = frame.to_vec();
            if let Some(last) = corrupted.last_mut() {
                *last ^= 0xff;
            } else {
                corrupted.push(0xff);
            }
            *frame = Bytes::from(corrupted);
        }
    }

    /// Waits out the bookie's configured delay, then checks it is reachable.
    async fn await_turn(&self, bookie: &BookieId) -> BookieResult<()> {
        let (delay, hung) = {
            let bookies = self.bookies.read();
            let state = bookies.get(bookie).ok_or_else(|| BookieError::unavailable(bookie.clone()))?;
            (state.delay, state.hung)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.bookies.read().get(bookie) {
            Some(state) if state.available => Ok(()),
            _ => Err(BookieError::unavailable(bookie.clone())),
        }
    }

    fn fence_ledger(state: &mut SimulatedBookie, ledger_id: LedgerId, master_key: &Bytes) -> BookieResult<()> {
        let ledger = state
            .ledgers
            .entry(ledger_id)
            .or_insert_with(|| StoredLedger { master_key: master_key.clone(), ..StoredLedger::default() });
        if ledger.master_key != *master_key {
            return Err(BookieError::unauthorized(ledger_id));
        }
        ledger.fenced = true;
        Ok(())
    }

    fn with_bookie<T>(
        &self,
        bookie: &BookieId,
        f: impl FnOnce(&mut SimulatedBookie) -> BookieResult<T>,
    ) -> BookieResult<T> {
        let mut bookies = self.bookies.write();
        match bookies.get_mut(bookie) {
            Some(state) if state.available => f(state),
            _ => Err(BookieError::unavailable(bookie.clone())),
        }
    }
}

#[async_trait]
impl BookieClient for MemoryBookieCluster {
    async fn add_entry(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        entry_id: i64,
        master_key: &[u8],
        payload: Bytes,
        flags: WriteFlags,
    ) -> BookieResult<()> {
        self.await_turn(bookie).await?;
        self.with_bookie(bookie, |state| {
            if state.read_only {
                return Err(BookieError::internal("bookie is read-only"));
            }
            let ledger = state.ledgers.entry(ledger_id).or_insert_with(|| StoredLedger {
                master_key: Bytes::copy_from_slice(master_key),
                ..StoredLedger::default()
            });
            if ledger.master_key.as_ref() != master_key {
                return Err(BookieError::unauthorized(ledger_id));
            }
            if ledger.fenced && !flags.recovery {
                return Err(BookieError::fenced(ledger_id));
            }
            ledger.entries.insert(entry_id, payload);
            Ok(())
        })
    }

    async fn read_entry(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        entry_id: i64,
        flags: ReadFlags,
    ) -> BookieResult<Bytes> {
        self.await_turn(bookie).await?;
        self.with_bookie(bookie, |state| {
            if let ReadFlags::Fence { master_key } = &flags {
                Self::fence_ledger(state, ledger_id, master_key)?;
            }
            let ledger =
                state.ledgers.get(&ledger_id).ok_or(BookieError::no_such_ledger(ledger_id))?;
            ledger
                .entries
                .get(&entry_id)
                .cloned()
                .ok_or(BookieError::no_such_entry(ledger_id, entry_id))
        })
    }

    async fn batch_read_entries(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        start_entry_id: i64,
        max_count: usize,
        max_size: usize,
    ) -> BookieResult<Vec<Bytes>> {
        self.await_turn(bookie).await?;
        self.with_bookie(bookie, |state| {
            let ledger =
                state.ledgers.get(&ledger_id).ok_or(BookieError::no_such_ledger(ledger_id))?;
            let mut frames = Vec::new();
            let mut size = 0usize;
            let mut next = start_entry_id;
            while frames.len() < max_count {
                let Some(frame) = ledger.entries.get(&next) else { break };
                if !frames.is_empty() && size + frame.len() > max_size {
                    break;
                }
                size += frame.len();
                frames.push(frame.clone());
                next += 1;
            }
            if frames.is_empty() {
                return Err(BookieError::no_such_entry(ledger_id, start_entry_id));
            }
            Ok(frames)
        })
    }

    async fn read_last_confirmed(
        &self,
        bookie: &BookieId,
        ledger_id: LedgerId,
        flags: ReadFlags,
    ) -> BookieResult<Option<Bytes>> {
        self.await_turn(bookie).await?;
        self.with_bookie(bookie, |state| {
            if let ReadFlags::Fence { master_key } = &flags {
                Self::fence_ledger(state, ledger_id, master_key)?;
            }
            let ledger =
                state.ledgers.get(&ledger_id).ok_or(BookieError::no_such_ledger(ledger_id))?;
            Ok(ledger.entries.values().next_back().cloned())
        })
    }
}

/// Versioned in-memory [`LedgerMetadataStore`].
///
/// Ledger ids are handed out sequentially from zero, skipping ids that were
/// claimed explicitly.
#[derive(Clone, Debug, Default)]
pub struct MemoryMetadataStore {
    records: Arc<RwLock<BTreeMap<LedgerId, Versioned<LedgerMetadata>>>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledgers currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if no ledger is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl LedgerMetadataStore for MemoryMetadataStore {
    async fn generate_ledger_id(&self) -> MetadataResult<LedgerId> {
        loop {
            let candidate = LedgerId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !self.records.read().contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    async fn create_ledger_metadata(
        &self,
        ledger_id: LedgerId,
        metadata: LedgerMetadata,
    ) -> MetadataResult<Versioned<LedgerMetadata>> {
        let mut records = self.records.write();
        if records.contains_key(&ledger_id) {
            return Err(MetadataError::LedgerExists { ledger_id });
        }
        let versioned = Versioned::new(metadata, 0);
        records.insert(ledger_id, versioned.clone());
        Ok(versioned)
    }

    async fn read_ledger_metadata(
        &self,
        ledger_id: LedgerId,
    ) -> MetadataResult<Versioned<LedgerMetadata>> {
        self.records.read().get(&ledger_id).cloned().ok_or(MetadataError::NoSuchLedger { ledger_id })
    }

    async fn write_ledger_metadata(
        &self,
        ledger_id: LedgerId,
        metadata: LedgerMetadata,
        expected_version: u64,
    ) -> MetadataResult<Versioned<LedgerMetadata>> {
        let mut records = self.records.write();
        let current =
            records.get_mut(&ledger_id).ok_or(MetadataError::NoSuchLedger { ledger_id })?;
        if current.version != expected_version {
            return Err(MetadataError::BadVersion {
                ledger_id,
                expected: expected_version,
                actual: current.version,
            });
        }
        *current = Versioned::new(metadata, expected_version + 1);
        Ok(current.clone())
    }

    async fn remove_ledger_metadata(&self, ledger_id: LedgerId) -> MetadataResult<()> {
        self.records
            .write()
            .remove(&ledger_id)
            .map(|_| ())
            .ok_or(MetadataError::NoSuchLedger { ledger_id })
    }

    async fn ledger_exists(&self, ledger_id: LedgerId) -> MetadataResult<bool> {
        Ok(self.records.read().contains_key(&ledger_id))
    }
}
