#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use meshplane::load_test::{
    ClusterInspector, DetectedAdapter, LatencySummary, LoadGenerator, LoadSummary, LoadTestError,
    LoadTestOptions, LoadTestRunner,
};
use meshplane::reconcile::ReconcileConfig;
use meshplane::results::ResultsCollector;
use meshplane::router::{build_router, AppState, USER_HEADER};
use meshplane_adapter_client::testing::ScriptedConnector;
use meshplane_adapter_client::BoxFuture;
use meshplane_session_store::{Adapter, ClusterAccess, ClusterNode, Session, SessionStore};
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const USER: &str = "u1";

pub async fn open_store() -> (Arc<SessionStore>, TempDir) {
    let dir = tempfile::tempdir().expect("create temp store dir");
    let store = SessionStore::open(dir.path()).await.expect("open store");
    (Arc::new(store), dir)
}

pub fn cluster() -> ClusterAccess {
    ClusterAccess {
        config: b"apiVersion: v1\nkind: Config\n".to_vec(),
        context_name: "kind-dev".to_string(),
        ..ClusterAccess::default()
    }
}

pub fn session_with(locations: &[&str]) -> Session {
    Session {
        cluster: Some(cluster()),
        adapters: locations.iter().map(|location| Adapter::at(*location)).collect(),
        ..Session::default()
    }
}

pub fn scripted(locations: &[&str]) -> ScriptedConnector {
    let connector = ScriptedConnector::new();
    for location in locations {
        connector.add_adapter(location, &location.to_uppercase());
    }
    connector
}

pub fn fast_config() -> ReconcileConfig {
    ReconcileConfig {
        interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(200),
        fan_in_capacity: 8,
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn summary(options: &LoadTestOptions) -> LoadSummary {
    LoadSummary {
        generator: options.generator,
        url: options.url.to_string(),
        start_time: Utc::now() - chrono::Duration::seconds(30),
        requested_duration_secs: options.duration.as_secs(),
        actual_duration_ms: 30_000,
        concurrency: options.concurrency,
        requested_qps: options.qps,
        actual_qps: 10.0,
        total_requests: 300,
        errors: 0,
        latency: LatencySummary {
            min_ms: 1.0,
            mean_ms: 4.0,
            p50_ms: 3.0,
            p90_ms: 8.0,
            p99_ms: 12.0,
            max_ms: 20.0,
        },
        status_codes: [(200, 300)].into_iter().collect(),
    }
}

/// Returns a canned summary, or fails when built with `failing`.
#[derive(Default)]
pub struct StubGenerator {
    pub fail: bool,
    pub runs: Mutex<usize>,
}

impl StubGenerator {
    pub fn failing() -> Self {
        Self {
            fail: true,
            runs: Mutex::new(0),
        }
    }
}

impl LoadGenerator for StubGenerator {
    fn run<'a>(
        &'a self,
        options: &'a LoadTestOptions,
    ) -> BoxFuture<'a, Result<LoadSummary, LoadTestError>> {
        Box::pin(async move {
            *self.runs.lock().expect("runs lock") += 1;
            if self.fail {
                Err(LoadTestError::Generator("target refused connections".to_string()))
            } else {
                Ok(summary(options))
            }
        })
    }
}

#[derive(Default)]
pub struct StubInspector {
    pub fail_nodes: bool,
}

impl ClusterInspector for StubInspector {
    fn nodes<'a>(
        &'a self,
        _cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<Vec<ClusterNode>, LoadTestError>> {
        Box::pin(async move {
            if self.fail_nodes {
                Err(LoadTestError::Inspect {
                    what: "cluster nodes",
                    message: "forbidden".to_string(),
                })
            } else {
                Ok(vec![ClusterNode {
                    name: "worker-1".to_string(),
                    ..ClusterNode::default()
                }])
            }
        })
    }

    fn server_version<'a>(
        &'a self,
        _cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<String, LoadTestError>> {
        Box::pin(async move { Ok("v1.29.2".to_string()) })
    }

    fn detect_adapters<'a>(
        &'a self,
        _cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<Vec<DetectedAdapter>, LoadTestError>> {
        Box::pin(async move {
            Ok(vec![DetectedAdapter {
                name: "istio".to_string(),
                version: "1.21.0".to_string(),
                namespace: "istio-system".to_string(),
            }])
        })
    }
}

pub fn collector(base_url: &str) -> ResultsCollector {
    ResultsCollector::new(reqwest::Client::new(), base_url, "meshplane_results")
        .expect("collector")
}

pub struct TestApp {
    pub app: Router,
    pub store: Arc<SessionStore>,
    pub connector: ScriptedConnector,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new(connector: ScriptedConnector) -> Self {
        Self::with_collector(connector, "http://127.0.0.1:9/").await
    }

    pub async fn with_collector(connector: ScriptedConnector, collector_url: &str) -> Self {
        let (store, dir) = open_store().await;
        let runner = LoadTestRunner::new(
            Arc::new(StubGenerator::default()),
            Arc::new(StubInspector::default()),
            collector(collector_url),
            None,
        );
        let state = Arc::new(AppState::new(
            store.clone(),
            Arc::new(connector.clone()),
            Arc::new(runner),
            fast_config(),
        ));
        Self {
            app: build_router(state),
            store,
            connector,
            _dir: dir,
        }
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        user: Option<&str>,
        body: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("request");
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request handled");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
        };
        (status, value)
    }
}

/// Parses `data: <json>\n\n` frames.
pub fn parse_frames(raw: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(raw)
        .split("\n\n")
        .filter_map(|block| block.strip_prefix("data: "))
        .map(|payload| serde_json::from_str(payload).expect("frame json"))
        .collect()
}

pub fn frame_value(frame: &[u8]) -> Value {
    let mut frames = parse_frames(frame);
    assert_eq!(frames.len(), 1, "expected exactly one frame");
    frames.remove(0)
}
