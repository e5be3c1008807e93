//! Integration test verifying that `#[instrument]` annotations produce
//! the expected spans on ledger operations.

#![allow(clippy::expect_used)]

use std::sync::Arc;

use parking_lot::Mutex;
use quorumlog_client::testutil::{options, TestCluster};
use quorumlog_cluster::DigestType;
use tracing::{span, Subscriber};
use tracing_subscriber::{layer::Context, layer::SubscriberExt, Layer};

/// Layer remembering the name of every span opened while it is installed.
#[derive(Clone, Default)]
struct SpanNames(Arc<Mutex<Vec<&'static str>>>);

impl<S: Subscriber> Layer<S> for SpanNames {
    fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
        self.0.lock().push(attrs.metadata().name());
    }
}

impl SpanNames {
    fn assert_seen(&self, name: &str) {
        let seen = self.0.lock();
        assert!(seen.iter().any(|s| *s == name), "no '{name}' span among {seen:?}");
    }
}

#[tokio::test]
async fn writer_operations_create_spans() {
    let names = SpanNames::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(names.clone()));

    let cluster = TestCluster::new(3);
    let ledger = cluster.client().create_ledger(options(3, 3, 2)).await.expect("create");
    ledger.add_entry(b"entry").await.expect("add");
    ledger.read_entries(0, 0).await.expect("read");
    ledger.batch_read_entries(0, 1, 0).await.expect("batch read");
    ledger.read_last_confirmed().await.expect("lac");
    ledger.close().await.expect("close");

    for name in ["create_ledger", "add_entry", "read_entries", "batch_read_entries", "read_last_confirmed", "close"] {
        names.assert_seen(name);
    }
}

#[tokio::test]
async fn recovery_open_creates_spans() {
    let names = SpanNames::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(names.clone()));

    let cluster = TestCluster::new(3);
    let writer = cluster.client().create_ledger(options(3, 2, 2)).await.expect("create");
    writer.add_entry(b"entry").await.expect("add");
    let client = cluster.client();
    client.open_ledger(writer.id(), DigestType::Crc32, b"pw").await.expect("open");
    client.delete_ledger(writer.id()).await.expect("delete");

    for name in ["open_ledger", "recover", "delete_ledger"] {
        names.assert_seen(name);
    }
}
