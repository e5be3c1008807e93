//! Bookie failure handling.
//!
//! Quorum arithmetic decides how many bookies may fail: reads of an entry
//! survive the loss of up to `W - A` copies, adds survive failures while the
//! ack quorum stays reachable, and ensemble changes swap failed bookies out
//! when spares exist.

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::time::Duration;

use quorumlog_client::{
    testutil::{options, TestCluster},
    ClientConfig, LedgerError,
};
use quorumlog_cluster::testutil::make_tagged_payload;
use rstest::rstest;

fn without_ensemble_change() -> ClientConfig {
    ClientConfig::builder()
        .add_entry_timeout(Duration::from_millis(200))
        .read_entry_timeout(Duration::from_millis(200))
        .ensemble_change_enabled(false)
        .build()
        .expect("config")
}

#[rstest]
#[case::three(3)]
#[case::five(5)]
#[tokio::test]
async fn full_quorum_survives_one_loss_for_reads(#[case] n: usize) {
    let cluster = TestCluster::new(n);
    let ledger = cluster.client().create_ledger(options(n, n, n)).await.expect("create");
    ledger.add_entry(b"data").await.expect("add");

    let ensemble = ledger.metadata().ensemble_at(0).to_vec();
    cluster.kill_bookie(&ensemble[0]);

    let entry = ledger.read_last_entry().await.expect("read last entry");
    assert_eq!(entry.payload().as_ref(), b"data");
}

#[rstest]
#[case::three(3)]
#[case::five(5)]
#[tokio::test]
async fn losing_every_bookie_fails_adds_and_reads(#[case] n: usize) {
    let cluster = TestCluster::new(n);
    let ledger = cluster.client().create_ledger(options(n, n, n)).await.expect("create");
    ledger.add_entry(b"data").await.expect("add");

    for bookie in cluster.bookies.bookie_ids() {
        cluster.kill_bookie(&bookie);
    }

    let add = ledger.add_entry(b"more").await;
    assert!(matches!(add, Err(LedgerError::NotEnoughBookies { .. })), "got {add:?}");

    let read = ledger.read_entries(0, 0).await;
    assert!(matches!(read, Err(LedgerError::BookieUnavailable { .. })), "got {read:?}");

    // The failed handle is sealed for writes.
    let again = ledger.add_entry(b"again").await;
    assert!(matches!(again, Err(LedgerError::LedgerClosed { .. })), "got {again:?}");
}

#[rstest]
#[case::striped(5, 3, 2)]
#[case::full_write_weak_ack(3, 3, 1)]
#[case::wide(5, 5, 3)]
#[tokio::test]
async fn reads_tolerate_losing_write_minus_ack_copies(#[case] e: usize, #[case] w: usize, #[case] a: usize) {
    let cluster = TestCluster::new(e);
    let ledger = cluster.client().create_ledger(options(e, w, a)).await.expect("create");
    ledger.add_entry(b"survivor").await.expect("add");

    // Kill the first W - A bookies of entry 0's write set.
    let ensemble = ledger.metadata().ensemble_at(0).to_vec();
    for bookie in &ensemble[..w - a] {
        cluster.kill_bookie(bookie);
    }

    let entries = ledger.read_entries(0, 0).await.expect("read");
    assert_eq!(entries[0].payload().as_ref(), b"survivor");
}

#[tokio::test]
async fn adds_survive_failures_within_the_ack_quorum() {
    let cluster = TestCluster::new(3);
    let ledger = cluster
        .client_with_config(without_ensemble_change())
        .create_ledger(options(3, 3, 2))
        .await
        .expect("create");

    let ensemble = ledger.metadata().ensemble_at(0).to_vec();
    cluster.kill_bookie(&ensemble[2]);

    for i in 0..5 {
        assert_eq!(ledger.add_entry(&make_tagged_payload(i)).await.expect("add"), i as i64);
    }
    assert_eq!(ledger.last_add_confirmed(), 4);
}

#[tokio::test]
async fn adds_fail_once_ack_quorum_is_unreachable() {
    let cluster = TestCluster::new(3);
    let ledger = cluster
        .client_with_config(without_ensemble_change())
        .create_ledger(options(3, 3, 2))
        .await
        .expect("create");
    ledger.add_entry(b"first").await.expect("add");

    let ensemble = ledger.metadata().ensemble_at(0).to_vec();
    cluster.kill_bookie(&ensemble[0]);
    cluster.kill_bookie(&ensemble[1]);

    let add = ledger.add_entry(b"second").await;
    assert!(matches!(add, Err(LedgerError::NotEnoughBookies { .. })), "got {add:?}");
    assert_eq!(ledger.last_add_confirmed(), 0);
}

#[tokio::test]
async fn hung_bookie_times_out_without_blocking_the_quorum() {
    let cluster = TestCluster::new(3);
    let ledger = cluster
        .client_with_config(without_ensemble_change())
        .create_ledger(options(3, 3, 2))
        .await
        .expect("create");

    let ensemble = ledger.metadata().ensemble_at(0).to_vec();
    cluster.bookies.hang_bookie(&ensemble[1]);

    assert_eq!(ledger.add_entry(b"quick").await.expect("add"), 0);
    let entries = ledger.read_entries(0, 0).await.expect("read");
    assert_eq!(entries[0].payload().as_ref(), b"quick");
}

#[tokio::test]
async fn ensemble_change_replaces_a_failed_bookie() {
    let cluster = TestCluster::new(4);
    let ledger = cluster.client().create_ledger(options(3, 3, 3)).await.expect("create");
    assert_eq!(ledger.add_entry(b"before").await.expect("add"), 0);

    let original = ledger.metadata().ensemble_at(0).to_vec();
    let failed = original[1].clone();
    cluster.kill_bookie(&failed);

    assert_eq!(ledger.add_entry(b"after").await.expect("add after change"), 1);

    let metadata = ledger.metadata();
    assert_eq!(metadata.ensembles.len(), 2);
    let (boundary, current) = metadata.last_ensemble();
    assert_eq!(boundary, 1);
    assert!(!current.contains(&failed));
    assert_eq!(current[0], original[0]);
    assert_eq!(current[2], original[2]);
    assert_eq!(cluster.stats.snapshot().ensemble_changes, 1);

    let entries = ledger.read_entries(0, 1).await.expect("read across ensembles");
    assert_eq!(entries[0].payload().as_ref(), b"before");
    assert_eq!(entries[1].payload().as_ref(), b"after");

    ledger.close().await.expect("close");
    assert_eq!(ledger.metadata().last_entry_id, 1);
}

#[tokio::test]
async fn ensemble_change_without_spares_fails_the_ledger() {
    let cluster = TestCluster::new(3);
    let ledger = cluster.client().create_ledger(options(3, 3, 3)).await.expect("create");
    ledger.add_entry(b"a").await.expect("add");

    let ensemble = ledger.metadata().ensemble_at(0).to_vec();
    cluster.kill_bookie(&ensemble[0]);

    let add = ledger.add_entry(b"b").await;
    assert!(matches!(add, Err(LedgerError::NotEnoughBookies { .. })), "got {add:?}");
    assert_eq!(cluster.stats.snapshot().ensemble_change_failures, 1);
    assert_eq!(ledger.last_add_confirmed(), 0);
}

#[tokio::test]
async fn writes_continue_on_a_degraded_ensemble_without_spares() {
    let cluster = TestCluster::new(3);
    let ledger = cluster.client().create_ledger(options(3, 3, 2)).await.expect("create");
    ledger.add_entry(&make_tagged_payload(0)).await.expect("add");

    let ensemble = ledger.metadata().ensemble_at(0).to_vec();
    cluster.kill_bookie(&ensemble[2]);

    for i in 1..6 {
        let entry_id = ledger.add_entry(&make_tagged_payload(i)).await.expect("add on degraded ensemble");
        assert_eq!(entry_id, i as i64);
    }
    assert_eq!(ledger.last_add_confirmed(), 5);
    assert!(!ledger.is_closed());
    assert_eq!(ledger.metadata().ensembles.len(), 1);
    assert_eq!(cluster.stats.snapshot().ensemble_change_failures, 1);

    // A second loss leaves fewer than A bookies for the next entry.
    cluster.kill_bookie(&ensemble[1]);
    let add = ledger.add_entry(b"unreachable").await;
    assert!(matches!(add, Err(LedgerError::NotEnoughBookies { .. })), "got {add:?}");
    let after = ledger.add_entry(b"after").await;
    assert!(matches!(after, Err(LedgerError::LedgerClosed { .. })), "got {after:?}");

    assert_eq!(ledger.last_add_confirmed(), 5);
    let entries = ledger.read_entries(0, 5).await.expect("read from the surviving bookie");
    assert_eq!(entries.len(), 6);
}

#[tokio::test]
async fn restarted_bookie_serves_its_entries_again() {
    let cluster = TestCluster::new(3);
    let ledger = cluster.client().create_ledger(options(3, 3, 3)).await.expect("create");
    ledger.add_entry(b"kept").await.expect("add");

    let bookies = cluster.bookies.bookie_ids();
    for bookie in &bookies {
        cluster.kill_bookie(bookie);
    }
    assert!(matches!(ledger.read_entries(0, 0).await, Err(LedgerError::BookieUnavailable { .. })));

    cluster.restart_bookie(&bookies[0]);
    let entries = ledger.read_entries(0, 0).await.expect("read after restart");
    assert_eq!(entries[0].payload().as_ref(), b"kept");
}

#[tokio::test]
async fn recovery_tolerates_a_dead_bookie() {
    let cluster = TestCluster::new(3);
    let writer = cluster.client().create_ledger(options(3, 3, 2)).await.expect("create");
    for i in 0..3 {
        writer.add_entry(&make_tagged_payload(i)).await.expect("add");
    }

    let ensemble = writer.metadata().ensemble_at(0).to_vec();
    cluster.kill_bookie(&ensemble[2]);

    let reader = cluster
        .client()
        .open_ledger(writer.id(), quorumlog_cluster::DigestType::Crc32, b"pw")
        .await
        .expect("recovery open");
    assert_eq!(reader.last_add_confirmed(), 2);
    let entries = reader.read_entries(0, 2).await.expect("read");
    assert_eq!(entries.len(), 3);
}
