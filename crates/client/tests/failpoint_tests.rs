#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p quorumlog-client --features failpoints --test failpoint_tests
//! ```

use quorumlog_client::{
    testutil::{options, TestCluster},
    ClientConfig, LedgerError,
};

#[tokio::test]
async fn add_send_failpoint_fails_the_add() {
    let scenario = fail::FailScenario::setup();
    let cluster = TestCluster::new(3);
    let config = ClientConfig::builder().ensemble_change_enabled(false).build().expect("config");
    let ledger = cluster.client_with_config(config).create_ledger(options(3, 2, 2)).await.expect("create");

    fail::cfg("add-entry-send", "return").expect("failed to configure fail point");
    let result = ledger.add_entry(b"doomed").await;
    assert!(matches!(result, Err(LedgerError::NotEnoughBookies { .. })), "got {result:?}");
    assert_eq!(ledger.last_add_confirmed(), -1);

    scenario.teardown();
}

#[tokio::test]
async fn add_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let cluster = TestCluster::new(3);
    let ledger = cluster.client().create_ledger(options(3, 2, 2)).await.expect("create");

    assert_eq!(ledger.add_entry(b"fine").await.expect("add"), 0);

    scenario.teardown();
}

#[tokio::test]
async fn read_send_failpoint_fails_the_read() {
    let scenario = fail::FailScenario::setup();
    let cluster = TestCluster::new(3);
    let ledger = cluster.client().create_ledger(options(3, 2, 2)).await.expect("create");
    ledger.add_entry(b"stored").await.expect("add");

    fail::cfg("read-entry-send", "return").expect("failed to configure fail point");
    let result = ledger.read_entries(0, 0).await;
    assert!(matches!(result, Err(LedgerError::Read { .. })), "got {result:?}");

    fail::remove("read-entry-send");
    let entries = ledger.read_entries(0, 0).await.expect("read after removal");
    assert_eq!(entries[0].payload().as_ref(), b"stored");

    scenario.teardown();
}

#[tokio::test]
async fn close_failpoint_leaves_metadata_open() {
    let scenario = fail::FailScenario::setup();
    let cluster = TestCluster::new(3);
    let client = cluster.client();
    let ledger = client.create_ledger(options(3, 2, 2)).await.expect("create");
    ledger.add_entry(b"a").await.expect("add");

    fail::cfg("ledger-close-before-metadata", "return").expect("failed to configure fail point");
    let result = ledger.close().await;
    assert!(matches!(result, Err(LedgerError::UnexpectedCondition { .. })), "got {result:?}");
    assert!(!client.is_closed(ledger.id()).await.expect("is_closed"));

    // Close reports its first outcome from then on.
    fail::remove("ledger-close-before-metadata");
    assert!(ledger.close().await.is_err());

    scenario.teardown();
}
