mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{fast_config, open_store, scripted, session_with, wait_until, USER};
use meshplane::reconcile::{ReconcileConfig, Reconciler};
use meshplane_adapter_client::testing::ScriptedConnector;
use meshplane_session_store::{ClusterAccess, Session, SessionStore};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    reconciler: Reconciler,
    connector: ScriptedConnector,
    store: Arc<SessionStore>,
    _outward: mpsc::Receiver<Bytes>,
    _dir: TempDir,
}

async fn harness(locations: &[&str], config: ReconcileConfig) -> Harness {
    let (store, dir) = open_store().await;
    let connector = scripted(&["adapter-a", "adapter-b", "adapter-c"]);
    store
        .write(USER, &session_with(locations))
        .await
        .expect("write session");
    let (outward_tx, outward_rx) = mpsc::channel(16);
    let reconciler = Reconciler::new(
        USER,
        store.clone(),
        Arc::new(connector.clone()),
        config,
        outward_tx,
    );
    Harness {
        reconciler,
        connector,
        store,
        _outward: outward_rx,
        _dir: dir,
    }
}

#[tokio::test]
async fn converges_to_declared_adapters() {
    let mut h = harness(&["adapter-a", "adapter-b"], fast_config()).await;

    let report = h.reconciler.tick().await;
    assert_eq!(report.connected, vec!["adapter-a", "adapter-b"]);
    assert_eq!(h.reconciler.live_locations(), vec!["adapter-a", "adapter-b"]);
    for location in ["adapter-a", "adapter-b"] {
        assert_eq!(h.connector.connect_count(location), 1);
        assert_eq!(h.connector.probe_count(location), 1);
    }

    let report = h.reconciler.tick().await;
    assert!(report.connected.is_empty());
    assert!(report.evicted.is_empty());
    for location in ["adapter-a", "adapter-b"] {
        assert_eq!(h.connector.connect_count(location), 1, "no reconnect while healthy");
        assert_eq!(h.connector.probe_count(location), 2);
    }
    assert_eq!(h.connector.connect_count("adapter-c"), 0);
}

#[tokio::test]
async fn unhealthy_adapter_is_evicted_then_reconnected_next_tick() {
    let mut h = harness(&["adapter-a", "adapter-b"], fast_config()).await;

    h.reconciler.tick().await;
    h.connector.set_healthy("adapter-b", false);

    let report = h.reconciler.tick().await;
    assert_eq!(report.evicted, vec!["adapter-b"]);
    assert!(report.connected.is_empty());
    assert_eq!(h.reconciler.live_locations(), vec!["adapter-a"]);
    assert_eq!(h.connector.connect_count("adapter-b"), 1);
    assert_eq!(h.connector.close_count("adapter-b"), 1);

    h.connector.set_healthy("adapter-b", true);
    let report = h.reconciler.tick().await;
    assert_eq!(report.connected, vec!["adapter-b"]);
    assert_eq!(h.reconciler.live_locations(), vec!["adapter-a", "adapter-b"]);
    assert_eq!(h.connector.connect_count("adapter-b"), 2);
    assert_eq!(h.connector.connect_count("adapter-a"), 1);
}

#[tokio::test]
async fn undeclared_adapter_is_closed() {
    let mut h = harness(&["adapter-a", "adapter-b"], fast_config()).await;
    h.reconciler.tick().await;

    h.store
        .write(USER, &session_with(&["adapter-a"]))
        .await
        .expect("write session");
    let report = h.reconciler.tick().await;
    assert_eq!(report.evicted, vec!["adapter-b"]);
    assert_eq!(h.reconciler.live_locations(), vec!["adapter-a"]);
    assert_eq!(h.connector.close_count("adapter-b"), 1);
    assert_eq!(h.connector.close_count("adapter-a"), 0);
}

#[tokio::test]
async fn invalid_cluster_tears_everything_down() {
    let mut h = harness(&["adapter-a", "adapter-b"], fast_config()).await;
    h.reconciler.tick().await;

    let session = Session {
        cluster: Some(ClusterAccess::default()),
        ..session_with(&["adapter-a", "adapter-b"])
    };
    h.store.write(USER, &session).await.expect("write session");

    let report = h.reconciler.tick().await;
    assert!(report.torn_down);
    assert_eq!(report.evicted, vec!["adapter-a", "adapter-b"]);
    assert!(h.reconciler.live_locations().is_empty());
    assert_eq!(h.connector.close_count("adapter-a"), 1);
    assert_eq!(h.connector.close_count("adapter-b"), 1);

    let report = h.reconciler.tick().await;
    assert!(report.torn_down);
    assert_eq!(h.connector.connect_count("adapter-a"), 1);
}

#[tokio::test]
async fn empty_adapter_list_tears_down() {
    let mut h = harness(&["adapter-a"], fast_config()).await;
    h.reconciler.tick().await;

    h.store
        .write(USER, &session_with(&[]))
        .await
        .expect("write session");
    let report = h.reconciler.tick().await;
    assert!(report.torn_down);
    assert!(h.reconciler.live_locations().is_empty());
}

#[tokio::test]
async fn missing_session_connects_nothing() {
    let mut h = harness(&["adapter-a"], fast_config()).await;
    h.store.delete(USER).await.expect("delete session");

    let report = h.reconciler.tick().await;
    assert!(report.torn_down);
    assert_eq!(h.connector.connect_count("adapter-a"), 0);
}

#[tokio::test]
async fn failed_connect_is_retried_next_tick() {
    let mut h = harness(&["adapter-a", "adapter-b"], fast_config()).await;
    h.connector.set_reachable("adapter-b", false);

    let report = h.reconciler.tick().await;
    assert_eq!(report.connected, vec!["adapter-a"]);
    assert_eq!(report.connect_failed, vec!["adapter-b"]);
    assert_eq!(h.reconciler.live_locations(), vec!["adapter-a"]);

    h.connector.set_reachable("adapter-b", true);
    let report = h.reconciler.tick().await;
    assert_eq!(report.connected, vec!["adapter-b"]);
    assert_eq!(h.connector.connect_count("adapter-b"), 2);
}

#[tokio::test]
async fn connected_but_unresponsive_adapter_is_not_registered() {
    let mut h = harness(&["adapter-a"], fast_config()).await;
    h.connector.set_healthy("adapter-a", false);

    let report = h.reconciler.tick().await;
    assert_eq!(report.connect_failed, vec!["adapter-a"]);
    assert!(h.reconciler.live_locations().is_empty());
    assert_eq!(h.connector.close_count("adapter-a"), 1);
}

#[tokio::test]
async fn slow_probe_counts_as_failure() {
    let config = ReconcileConfig {
        probe_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let mut h = harness(&["adapter-a", "adapter-b"], config).await;
    h.reconciler.tick().await;

    h.connector
        .set_probe_delay("adapter-b", Some(Duration::from_millis(500)));
    let started = tokio::time::Instant::now();
    let report = h.reconciler.tick().await;
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(report.evicted, vec!["adapter-b"]);
    assert_eq!(h.reconciler.live_locations(), vec!["adapter-a"]);
}

#[tokio::test]
async fn ended_stream_reconnects() {
    let mut h = harness(&["adapter-a"], fast_config()).await;
    h.reconciler.tick().await;
    let connector = h.connector.clone();
    assert!(wait_until(Duration::from_secs(2), || connector.open_streams("adapter-a") == 1).await);

    h.connector.end_streams("adapter-a");
    assert!(wait_until(Duration::from_secs(2), || connector.close_count("adapter-a") == 1).await);

    let report = h.reconciler.tick().await;
    assert_eq!(report.connected, vec!["adapter-a"]);
    assert_eq!(h.connector.connect_count("adapter-a"), 2);
    assert_eq!(h.reconciler.live_locations(), vec!["adapter-a"]);
}

#[tokio::test]
async fn duplicate_declarations_share_one_client() {
    let mut h = harness(&["adapter-a", "adapter-a", "adapter-b"], fast_config()).await;

    let report = h.reconciler.tick().await;
    assert_eq!(report.connected, vec!["adapter-a", "adapter-b"]);
    assert_eq!(h.connector.connect_count("adapter-a"), 1);
}

#[tokio::test]
async fn teardown_closes_every_client() {
    let mut h = harness(&["adapter-a", "adapter-b"], fast_config()).await;
    h.reconciler.tick().await;

    h.reconciler.teardown().await;
    assert!(h.reconciler.live_locations().is_empty());
    assert_eq!(h.connector.close_count("adapter-a"), 1);
    assert_eq!(h.connector.close_count("adapter-b"), 1);
    assert_eq!(h.connector.open_streams("adapter-a"), 0);
}
