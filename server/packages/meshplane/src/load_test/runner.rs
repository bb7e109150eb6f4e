use std::sync::Arc;

use bytes::Bytes;
use meshplane_session_store::Session;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{
    ClusterInspector, LoadGenerator, LoadTestError, LoadTestOptions, LoadTestResult, MetricSource,
};
use crate::aggregator::frame_json;
use crate::metrics::{tracked_queries, MetricsJob, MetricsQueue};
use crate::results::ResultsCollector;

const STATUS_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Info,
    Error,
    Success,
}

/// One progress frame of a load test.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: RunStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<LoadTestResult>,
}

impl StatusEvent {
    fn info(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Info,
            message: message.into(),
            result_id: None,
            result: None,
        }
    }
}

struct StatusSink {
    out: mpsc::Sender<Bytes>,
}

impl StatusSink {
    /// A vanished receiver is not an error; the run still completes and
    /// publishes.
    async fn send(&self, event: &StatusEvent) {
        match frame_json(event) {
            Ok(frame) => {
                let _ = self.out.send(frame).await;
            }
            Err(err) => tracing::warn!(error = %err, "unable to encode status event"),
        }
    }
}

pub struct LoadTestRunner {
    generator: Arc<dyn LoadGenerator>,
    inspector: Arc<dyn ClusterInspector>,
    collector: ResultsCollector,
    metrics: Option<MetricsQueue>,
}

impl LoadTestRunner {
    pub fn new(
        generator: Arc<dyn LoadGenerator>,
        inspector: Arc<dyn ClusterInspector>,
        collector: ResultsCollector,
        metrics: Option<MetricsQueue>,
    ) -> Self {
        Self {
            generator,
            inspector,
            collector,
            metrics,
        }
    }

    /// Runs the test in the background and returns the framed status stream.
    pub fn spawn(
        self: Arc<Self>,
        options: LoadTestOptions,
        session: Session,
        token: Option<String>,
    ) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(STATUS_BUFFER);
        tokio::spawn(async move {
            self.run(&options, &session, token.as_deref(), tx).await;
        });
        rx
    }

    /// Emits progress to `out`, ending with exactly one `success` or `error`
    /// frame.
    pub async fn run(
        &self,
        options: &LoadTestOptions,
        session: &Session,
        token: Option<&str>,
        out: mpsc::Sender<Bytes>,
    ) {
        let sink = StatusSink { out };
        match self.execute(options, session, token, &sink).await {
            Ok((result, result_id)) => {
                tracing::info!(name = %options.name, result_id = ?result_id, "load test finished");
                sink.send(&StatusEvent {
                    status: RunStatus::Success,
                    message: "Load test completed".to_string(),
                    result_id,
                    result: Some(result),
                })
                .await;
            }
            Err(err) => {
                tracing::warn!(name = %options.name, error = %err, "load test failed");
                sink.send(&StatusEvent {
                    status: RunStatus::Error,
                    message: err.to_string(),
                    result_id: None,
                    result: None,
                })
                .await;
            }
        }
    }

    async fn execute(
        &self,
        options: &LoadTestOptions,
        session: &Session,
        token: Option<&str>,
        sink: &StatusSink,
    ) -> Result<(LoadTestResult, Option<String>), LoadTestError> {
        sink.send(&StatusEvent::info("Initiating load test")).await;
        let summary = self.generator.run(options).await?;
        sink.send(&StatusEvent::info(format!(
            "Load test completed: {} requests in {} ms",
            summary.total_requests, summary.actual_duration_ms
        )))
        .await;

        let sources = match session.valid_cluster() {
            Some(cluster) => {
                sink.send(&StatusEvent::info("Collecting cluster details")).await;
                let nodes = async {
                    if cluster.nodes.is_empty() {
                        self.inspector.nodes(cluster).await
                    } else {
                        Ok(cluster.nodes.clone())
                    }
                };
                let version = async {
                    if cluster.server_version.is_empty() {
                        self.inspector.server_version(cluster).await
                    } else {
                        Ok(cluster.server_version.clone())
                    }
                };
                let detected = self.inspector.detect_adapters(cluster);
                let (nodes, version, detected) = tokio::join!(nodes, version, detected);
                merge_cluster_facts(nodes, version, detected)
            }
            None => Vec::new(),
        };

        let result = LoadTestResult {
            name: options.name.clone(),
            mesh: options.mesh.clone(),
            test_uuid: options.test_uuid.clone(),
            load_generator: options.generator,
            summary,
            sources,
        };

        sink.send(&StatusEvent::info("Publishing results")).await;
        let result_id = self.collector.create(token, &result).await?;
        sink.send(&StatusEvent::info("Results published")).await;

        if let (Some(prometheus_url), Some(test_uuid), Some(result_id), Some(queue)) = (
            session.prometheus_url(),
            result.test_uuid.as_deref(),
            result_id.as_deref(),
            self.metrics.as_ref(),
        ) {
            let queries = session
                .prometheus
                .as_ref()
                .map(tracked_queries)
                .unwrap_or_default();
            queue.enqueue(MetricsJob {
                prometheus_url: prometheus_url.to_string(),
                token: token.map(str::to_string),
                result_id: result_id.to_string(),
                test_uuid: test_uuid.to_string(),
                start: result.summary.start_time,
                end: result.summary.end_time(),
                queries,
            });
        }

        Ok((result, result_id))
    }
}

/// Failed lookups are dropped with a warning; they never fail the run.
fn merge_cluster_facts(
    nodes: Result<Vec<meshplane_session_store::ClusterNode>, LoadTestError>,
    version: Result<String, LoadTestError>,
    detected: Result<Vec<super::DetectedAdapter>, LoadTestError>,
) -> Vec<MetricSource> {
    let mut sources = Vec::new();
    let nodes = nodes.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "node lookup failed");
        Vec::new()
    });
    let server_version = version.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "server version lookup failed");
        String::new()
    });
    if !nodes.is_empty() || !server_version.is_empty() {
        sources.push(MetricSource::ClusterNodes {
            nodes,
            server_version,
        });
    }
    match detected {
        Ok(adapters) => sources.push(MetricSource::DetectedAdapters { adapters }),
        Err(err) => tracing::warn!(error = %err, "mesh detection failed"),
    }
    sources
}
