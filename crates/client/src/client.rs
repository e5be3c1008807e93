//! Ledger client: creates, opens and deletes ledgers.
//!
//! A [`LedgerClient`] ties the three collaborators of [`ClientContext`]
//! together with a [`ClientConfig`] and an ordered completion executor shared
//! by every handle it hands out.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use quorumlog_client::{ClientConfig, ClientContext, LedgerClient, LedgerOptions};
//! use quorumlog_cluster::{MemoryBookieCluster, MemoryMetadataStore, RandomPlacementPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = MemoryBookieCluster::with_bookies(3);
//!     let context = ClientContext::builder()
//!         .bookie_client(Arc::new(cluster.clone()))
//!         .placement(Arc::new(RandomPlacementPolicy::new(cluster.bookie_ids())))
//!         .metadata_store(Arc::new(MemoryMetadataStore::new()))
//!         .build();
//!     let client = LedgerClient::new(ClientConfig::default(), context)?;
//!
//!     let ledger = client.create_ledger(LedgerOptions::default()).await?;
//!     let entry_id = ledger.add_entry(b"hello").await?;
//!     let entries = ledger.read_entries(entry_id, entry_id).await?;
//!     assert_eq!(entries[0].payload().as_ref(), b"hello");
//!     ledger.close().await?;
//!     Ok(())
//! }
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use quorumlog_cluster::{
    BookieClient, ClientStats, ConfigError, DigestType, EnsemblePlacementPolicy, LedgerId,
    LedgerMetadata, LedgerMetadataStore, QuorumSizes, Versioned, INVALID_ENTRY_ID,
};

use crate::{
    config::ClientConfig,
    error::{LedgerError, LedgerResult},
    executor::OrderedExecutor,
    handle::{HandleMode, LedgerHandle},
    recovery,
};

/// Default number of bookies a ledger is striped over.
pub const DEFAULT_ENSEMBLE_SIZE: usize = 3;

/// Default number of bookies each entry is written to.
pub const DEFAULT_WRITE_QUORUM: usize = 2;

/// The collaborators a client drives.
#[derive(Debug, Clone, bon::Builder)]
pub struct ClientContext {
    /// Transport to individual bookies.
    pub bookie_client: Arc<dyn BookieClient>,
    /// Chooses ensemble members and replacements.
    pub placement: Arc<dyn EnsemblePlacementPolicy>,
    /// Persists ledger metadata.
    pub metadata_store: Arc<dyn LedgerMetadataStore>,
    /// Statistics sink shared by every handle.
    #[builder(default)]
    pub stats: Arc<ClientStats>,
}

/// State shared by a client and all of its handles.
#[derive(Debug)]
pub(crate) struct ClientShared {
    pub(crate) config: ClientConfig,
    pub(crate) context: ClientContext,
    pub(crate) executor: OrderedExecutor,
}

/// Parameters of a new ledger.
///
/// `ack_quorum` defaults to the write quorum. `Debug` output redacts the
/// password.
#[derive(Clone, PartialEq, Eq, bon::Builder)]
pub struct LedgerOptions {
    /// Number of bookies the ledger is striped over.
    #[builder(default = DEFAULT_ENSEMBLE_SIZE)]
    pub ensemble_size: usize,
    /// Number of bookies each entry is written to.
    #[builder(default = DEFAULT_WRITE_QUORUM)]
    pub write_quorum: usize,
    /// Acknowledgements required before an add completes.
    pub ack_quorum: Option<usize>,
    /// Digest kind sealing each entry.
    #[builder(default)]
    pub digest_type: DigestType,
    /// Password keying the digest and guarding opens.
    #[builder(default, into)]
    pub password: Vec<u8>,
    /// Opaque application metadata.
    #[builder(default)]
    pub custom_metadata: BTreeMap<String, Vec<u8>>,
}

impl std::fmt::Debug for LedgerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerOptions")
            .field("ensemble_size", &self.ensemble_size)
            .field("write_quorum", &self.write_quorum)
            .field("ack_quorum", &self.ack_quorum)
            .field("digest_type", &self.digest_type)
            .field("password", &"[REDACTED]")
            .field("custom_metadata", &self.custom_metadata)
            .finish()
    }
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LedgerOptions {
    /// Validated quorum sizes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] unless `1 <= ack <= write <= ensemble`.
    pub fn quorum(&self) -> Result<QuorumSizes, ConfigError> {
        QuorumSizes::new(self.ensemble_size, self.write_quorum, self.ack_quorum.unwrap_or(self.write_quorum))
    }
}

/// Entry point for creating, opening and deleting ledgers.
#[derive(Debug)]
pub struct LedgerClient {
    shared: Arc<ClientShared>,
    closed: AtomicBool,
}

impl LedgerClient {
    /// Creates a client over `context`.
    ///
    /// Spawns the completion workers, so it must be called from within a
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if `config` is invalid.
    pub fn new(config: ClientConfig, context: ClientContext) -> LedgerResult<Self> {
        config.validate()?;
        let executor = OrderedExecutor::new(config.num_workers());
        Ok(Self { shared: Arc::new(ClientShared { config, context, executor }), closed: AtomicBool::new(false) })
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Statistics shared by all handles of this client.
    #[must_use]
    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.shared.context.stats
    }

    fn ensure_open(&self) -> LedgerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LedgerError::ClientClosed);
        }
        Ok(())
    }

    /// Creates a ledger with a store-allocated id and returns its writable handle.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidArgument`] for invalid quorum sizes, before any other work
    /// - [`LedgerError::NotEnoughBookies`] if no ensemble can be formed
    /// - [`LedgerError::ClientClosed`] after [`close`](Self::close)
    #[tracing::instrument(skip(self, options), fields(ensemble_size = options.ensemble_size))]
    pub async fn create_ledger(&self, options: LedgerOptions) -> LedgerResult<LedgerHandle> {
        self.ensure_open()?;
        let quorum = options.quorum()?;
        let ledger_id = self
            .shared
            .context
            .metadata_store
            .generate_ledger_id()
            .await
            .map_err(|err| LedgerError::from_metadata(LedgerId::from(INVALID_ENTRY_ID), err))?;
        self.create_with_id(ledger_id, quorum, options).await
    }

    /// Creates a ledger under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidArgument`] for a negative id or invalid quorum sizes
    /// - [`LedgerError::LedgerExists`] if the id is taken
    /// - [`LedgerError::NotEnoughBookies`] if no ensemble can be formed
    #[tracing::instrument(skip(self, options), fields(ledger_id = %ledger_id))]
    pub async fn create_ledger_with_id(
        &self,
        ledger_id: LedgerId,
        options: LedgerOptions,
    ) -> LedgerResult<LedgerHandle> {
        self.ensure_open()?;
        if !ledger_id.is_valid() {
            return Err(LedgerError::invalid_argument(format!("ledger id {ledger_id} is negative")));
        }
        let quorum = options.quorum()?;
        self.create_with_id(ledger_id, quorum, options).await
    }

    async fn create_with_id(
        &self,
        ledger_id: LedgerId,
        quorum: QuorumSizes,
        options: LedgerOptions,
    ) -> LedgerResult<LedgerHandle> {
        let context = &self.shared.context;
        let ensemble = context
            .placement
            .new_ensemble(quorum, &options.custom_metadata, &HashSet::new())
            .map_err(|err| LedgerError::from_placement(ledger_id, err))?;

        let metadata = LedgerMetadata::builder()
            .quorum(quorum)
            .digest_type(options.digest_type)
            .password(options.password.clone())
            .ensembles(BTreeMap::from([(0, ensemble)]))
            .custom_metadata(options.custom_metadata)
            .build();
        let versioned = context
            .metadata_store
            .create_ledger_metadata(ledger_id, metadata)
            .await
            .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;

        tracing::info!(
            ledger_id = %ledger_id,
            ensemble_size = quorum.ensemble_size(),
            write_quorum = quorum.write_quorum(),
            ack_quorum = quorum.ack_quorum(),
            "ledger created"
        );
        Ok(LedgerHandle::new(Arc::clone(&self.shared), ledger_id, versioned, &options.password, HandleMode::Writable))
    }

    /// Opens a ledger for reading, fencing and recovering it first if it
    /// is not closed. The returned handle sees the whole sealed ledger.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LedgerNotFound`] if no such ledger exists
    /// - [`LedgerError::UnauthorizedAccess`] on a password or digest kind mismatch
    /// - any read or metadata error raised during recovery
    #[tracing::instrument(skip(self, password), fields(ledger_id = %ledger_id))]
    pub async fn open_ledger(
        &self,
        ledger_id: LedgerId,
        digest_type: DigestType,
        password: &[u8],
    ) -> LedgerResult<LedgerHandle> {
        let handle = self.open_handle(ledger_id, digest_type, password).await?;
        if !handle.metadata().is_closed() {
            recovery::recover(&handle).await?;
        }
        Ok(handle)
    }

    /// Opens a ledger for reading without fencing it.
    ///
    /// The writer may keep appending; the handle only sees entries up to the
    /// last-add-confirmed it discovers.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LedgerNotFound`] if no such ledger exists
    /// - [`LedgerError::UnauthorizedAccess`] on a password or digest kind mismatch
    #[tracing::instrument(skip(self, password), fields(ledger_id = %ledger_id))]
    pub async fn open_ledger_no_recovery(
        &self,
        ledger_id: LedgerId,
        digest_type: DigestType,
        password: &[u8],
    ) -> LedgerResult<LedgerHandle> {
        let handle = self.open_handle(ledger_id, digest_type, password).await?;
        if !handle.metadata().is_closed() {
            if let Err(err) = handle.read_last_confirmed().await {
                tracing::warn!(ledger_id = %ledger_id, error = %err, "could not discover last add confirmed on open");
            }
        }
        Ok(handle)
    }

    async fn open_handle(
        &self,
        ledger_id: LedgerId,
        digest_type: DigestType,
        password: &[u8],
    ) -> LedgerResult<LedgerHandle> {
        self.ensure_open()?;
        let metadata = self
            .shared
            .context
            .metadata_store
            .read_ledger_metadata(ledger_id)
            .await
            .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;

        if metadata.value.password != password {
            tracing::warn!(ledger_id = %ledger_id, "open rejected: password mismatch");
            return Err(LedgerError::UnauthorizedAccess { ledger_id });
        }
        if metadata.value.digest_type != digest_type {
            if !self.shared.config.digest_autodetection() {
                tracing::warn!(
                    ledger_id = %ledger_id,
                    requested = %digest_type,
                    stored = %metadata.value.digest_type,
                    "open rejected: digest type mismatch"
                );
                return Err(LedgerError::UnauthorizedAccess { ledger_id });
            }
            tracing::debug!(ledger_id = %ledger_id, stored = %metadata.value.digest_type, "using stored digest type");
        }
        Ok(LedgerHandle::new(Arc::clone(&self.shared), ledger_id, metadata, password, HandleMode::ReadOnly))
    }

    /// Removes a ledger's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::LedgerNotFound`] if no such ledger exists.
    #[tracing::instrument(skip(self), fields(ledger_id = %ledger_id))]
    pub async fn delete_ledger(&self, ledger_id: LedgerId) -> LedgerResult<()> {
        self.ensure_open()?;
        self.shared
            .context
            .metadata_store
            .remove_ledger_metadata(ledger_id)
            .await
            .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;
        tracing::info!(ledger_id = %ledger_id, "ledger deleted");
        Ok(())
    }

    /// Returns `true` if the ledger is sealed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::LedgerNotFound`] if no such ledger exists.
    pub async fn is_closed(&self, ledger_id: LedgerId) -> LedgerResult<bool> {
        self.ensure_open()?;
        let metadata: Versioned<LedgerMetadata> = self
            .shared
            .context
            .metadata_store
            .read_ledger_metadata(ledger_id)
            .await
            .map_err(|err| LedgerError::from_metadata(ledger_id, err))?;
        Ok(metadata.value.is_closed())
    }

    /// Closes the client. Later calls on it fail with [`LedgerError::ClientClosed`].
    ///
    /// Handles already handed out keep working until they are closed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("ledger client closed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn options_debug_redacts_password() {
        let options = LedgerOptions::builder().password(b"hunter2".as_slice()).build();
        let debug = format!("{options:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn options_default_ack_quorum_to_write_quorum() {
        let options = LedgerOptions::default();
        let quorum = options.quorum().unwrap();
        assert_eq!(quorum.ensemble_size(), 3);
        assert_eq!(quorum.write_quorum(), 2);
        assert_eq!(quorum.ack_quorum(), 2);
        assert_eq!(options.digest_type, DigestType::Crc32);
        assert!(options.password.is_empty());
    }

    #[rstest]
    #[case::ack_above_write(3, 2, Some(3))]
    #[case::write_above_ensemble(2, 3, None)]
    #[case::empty_ensemble(0, 0, Some(0))]
    fn options_reject_invalid_quorums(#[case] e: usize, #[case] w: usize, #[case] a: Option<usize>) {
        let options = LedgerOptions::builder().ensemble_size(e).write_quorum(w).maybe_ack_quorum(a).build();
        assert!(options.quorum().is_err());
    }

    #[test]
    fn options_password_accepts_slices() {
        let options = LedgerOptions::builder().password(b"secret".as_slice()).build();
        assert_eq!(options.password, b"secret".to_vec());
    }
}
