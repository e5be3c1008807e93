//! Test harness wiring a [`LedgerClient`] to an in-memory cluster.
//!
//! Feature-gated behind `testutil`.
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use quorumlog_client::testutil::TestCluster;
//! ```

use std::{sync::Arc, time::Duration};

use quorumlog_cluster::{
    BookieId, ClientStats, EnsemblePlacementPolicy, LedgerMetadataStore, MemoryBookieCluster, MemoryMetadataStore,
    RandomPlacementPolicy,
};

use crate::{
    client::{ClientContext, LedgerClient, LedgerOptions},
    config::ClientConfig,
};

/// Bookies, metadata store, placement policy and stats shared by any number
/// of clients.
#[derive(Debug, Clone)]
pub struct TestCluster {
    /// The simulated bookies.
    pub bookies: MemoryBookieCluster,
    /// The metadata store.
    pub metadata: Arc<MemoryMetadataStore>,
    /// The placement policy, kept in sync with bookie liveness.
    pub placement: Arc<RandomPlacementPolicy>,
    /// Stats shared by every client built from this cluster.
    pub stats: Arc<ClientStats>,
}

impl TestCluster {
    /// A cluster of `bookies` healthy bookies named `bookie-0..`.
    #[must_use]
    pub fn new(bookies: usize) -> Self {
        let cluster = MemoryBookieCluster::with_bookies(bookies);
        let placement = Arc::new(RandomPlacementPolicy::new(cluster.bookie_ids()));
        Self {
            bookies: cluster,
            metadata: Arc::new(MemoryMetadataStore::new()),
            placement,
            stats: Arc::new(ClientStats::new()),
        }
    }

    /// The collaborators a client needs.
    #[must_use]
    pub fn context(&self) -> ClientContext {
        ClientContext::builder()
            .bookie_client(Arc::new(self.bookies.clone()))
            .placement(Arc::clone(&self.placement) as Arc<dyn EnsemblePlacementPolicy>)
            .metadata_store(Arc::clone(&self.metadata) as Arc<dyn LedgerMetadataStore>)
            .stats(Arc::clone(&self.stats))
            .build()
    }

    /// A client with short timeouts suited to tests.
    pub fn client(&self) -> LedgerClient {
        let config = ClientConfig::builder()
            .add_entry_timeout(Duration::from_millis(500))
            .read_entry_timeout(Duration::from_millis(500))
            .build()
            .expect("valid test config");
        self.client_with_config(config)
    }

    /// A client with the given configuration.
    pub fn client_with_config(&self, config: ClientConfig) -> LedgerClient {
        LedgerClient::new(config, self.context()).expect("client construction")
    }

    /// Takes `bookie` down and tells the placement policy.
    pub fn kill_bookie(&self, bookie: &BookieId) {
        self.bookies.kill_bookie(bookie);
        self.sync_membership();
    }

    /// Brings `bookie` back and tells the placement policy.
    pub fn restart_bookie(&self, bookie: &BookieId) {
        self.bookies.restart_bookie(bookie);
        self.sync_membership();
    }

    fn sync_membership(&self) {
        self.placement.on_cluster_changed(&self.bookies.writable_bookies(), &self.bookies.read_only_bookies());
    }
}

/// Options for a ledger with the given quorum sizes and password `"pw"`.
pub fn options(ensemble_size: usize, write_quorum: usize, ack_quorum: usize) -> LedgerOptions {
    LedgerOptions::builder()
        .ensemble_size(ensemble_size)
        .write_quorum(write_quorum)
        .ack_quorum(ack_quorum)
        .password(b"pw".as_slice())
        .build()
}
