//! Follow-up jobs that attach Prometheus time series to a published result.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use meshplane_session_store::PrometheusConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::load_test::MetricSource;
use crate::results::{CollectorError, MetricsSubmission, ResultsCollector};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_JOB_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid prometheus url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("prometheus request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("prometheus request timed out")]
    Timeout,
    #[error("prometheus responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("prometheus query failed: {0}")]
    Query(String),
    #[error("no tracked query returned data")]
    NoData,
    #[error(transparent)]
    Publish(#[from] CollectorError),
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// (upper bound of the window, step) in seconds; windows past the last bound
/// use a 30 day step.
const STEP_TABLE: &[(u64, u64)] = &[
    (10 * MINUTE, 5),
    (30 * MINUTE, 10),
    (HOUR, 20),
    (3 * HOUR, MINUTE),
    (6 * HOUR, 2 * MINUTE),
    (DAY, 8 * MINUTE),
    (2 * DAY, 16 * MINUTE),
    (4 * DAY, 32 * MINUTE),
    (7 * DAY, 56 * MINUTE),
    (15 * DAY, 2 * HOUR),
    (30 * DAY, 4 * HOUR),
    (90 * DAY, 12 * HOUR),
    (180 * DAY, DAY),
    (360 * DAY, 2 * DAY),
    (720 * DAY, 4 * DAY),
    (1800 * DAY, 10 * DAY),
];

/// Resolution for a range query over `window`, coarser as the window grows.
pub fn compute_step(window: Duration) -> Duration {
    let secs = window.as_secs_f64();
    let step = STEP_TABLE
        .iter()
        .find(|(bound, _)| secs <= *bound as f64)
        .map(|(_, step)| *step)
        .unwrap_or(30 * DAY);
    Duration::from_secs(step)
}

#[derive(Debug, Clone)]
pub struct PrometheusClient {
    http: Client,
    base: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

impl PrometheusClient {
    pub fn new(http: Client, base_url: &str, timeout: Duration) -> Result<Self, MetricsError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized).map_err(|err| MetricsError::InvalidUrl {
            url: base_url.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            http,
            base,
            timeout,
        })
    }

    /// Returns the `data` object of a successful range query.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Value, MetricsError> {
        let url = self
            .base
            .join("api/v1/query_range")
            .map_err(|err| MetricsError::InvalidUrl {
                url: self.base.to_string(),
                message: err.to_string(),
            })?;
        let params = [
            ("query", query.to_string()),
            ("start", unix_seconds(start)),
            ("end", unix_seconds(end)),
            ("step", format!("{}s", step.as_secs().max(1))),
        ];
        let response = self
            .http
            .get(url)
            .query(&params)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    MetricsError::Timeout
                } else {
                    MetricsError::Transport(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 422 && status.as_u16() != 400 {
            return Err(MetricsError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body: PromResponse = response.json().await?;
        if body.status != "success" {
            return Err(MetricsError::Query(
                body.error.unwrap_or_else(|| format!("status {}", body.status)),
            ));
        }
        Ok(body.data)
    }
}

fn unix_seconds(at: DateTime<Utc>) -> String {
    format!("{:.3}", at.timestamp_millis() as f64 / 1000.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedQuery {
    pub panel: String,
    pub expr: String,
}

/// Every distinct target expression on the selected dashboard panels.
pub fn tracked_queries(config: &PrometheusConfig) -> Vec<TrackedQuery> {
    let mut seen = HashSet::new();
    let mut queries = Vec::new();
    for board in &config.boards {
        for panel in &board.panels {
            let title = panel
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(targets) = panel.get("targets").and_then(Value::as_array) else {
                continue;
            };
            for target in targets {
                let Some(expr) = target
                    .get("expr")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|expr| !expr.is_empty())
                else {
                    continue;
                };
                if seen.insert(expr.to_string()) {
                    queries.push(TrackedQuery {
                        panel: title.to_string(),
                        expr: expr.to_string(),
                    });
                }
            }
        }
    }
    queries
}

#[derive(Debug, Clone)]
pub struct MetricsJob {
    pub prometheus_url: String,
    pub token: Option<String>,
    pub result_id: String,
    pub test_uuid: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub queries: Vec<TrackedQuery>,
}

/// Producer side of the metrics job queue.
#[derive(Debug, Clone)]
pub struct MetricsQueue {
    jobs: mpsc::Sender<MetricsJob>,
}

impl MetricsQueue {
    /// Never waits; a full or stopped queue drops the job with a warning.
    pub fn enqueue(&self, job: MetricsJob) -> bool {
        let result_id = job.result_id.clone();
        match self.jobs.try_send(job) {
            Ok(()) => {
                tracing::debug!(result_id = %result_id, "metrics job queued");
                true
            }
            Err(err) => {
                tracing::warn!(result_id = %result_id, error = %err, "metrics job dropped");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsWorker {
    http: Client,
    collector: ResultsCollector,
    query_timeout: Duration,
}

impl MetricsWorker {
    pub fn new(http: Client, collector: ResultsCollector, query_timeout: Duration) -> Self {
        Self {
            http,
            collector,
            query_timeout,
        }
    }

    /// Starts the single worker task. It stops when `shutdown` fires or every
    /// queue handle is dropped.
    pub fn spawn(
        self,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (MetricsQueue, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<MetricsJob>(capacity.max(1));
        let handle = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let result_id = job.result_id.clone();
                match self.run_job(job).await {
                    Ok(count) => {
                        tracing::info!(result_id = %result_id, series = count, "metrics published")
                    }
                    Err(err) => {
                        tracing::warn!(result_id = %result_id, error = %err, "metrics job failed")
                    }
                }
            }
            tracing::debug!("metrics worker stopped");
        });
        (MetricsQueue { jobs: tx }, handle)
    }

    /// Queries every tracked expression over the job window and submits the
    /// series that came back. Returns how many were submitted.
    pub async fn run_job(&self, job: MetricsJob) -> Result<usize, MetricsError> {
        let prometheus =
            PrometheusClient::new(self.http.clone(), &job.prometheus_url, self.query_timeout)?;
        let window = (job.end - job.start).to_std().unwrap_or_default();
        let step = compute_step(window);

        let mut metrics = Vec::new();
        for query in &job.queries {
            match prometheus
                .query_range(&query.expr, job.start, job.end, step)
                .await
            {
                Ok(data) => metrics.push(MetricSource::TimeSeries {
                    query: query.expr.clone(),
                    panel: query.panel.clone(),
                    step_secs: step.as_secs(),
                    data,
                }),
                Err(err) => {
                    tracing::warn!(query = %query.expr, error = %err, "skipping metrics query")
                }
            }
        }
        if metrics.is_empty() {
            return Err(MetricsError::NoData);
        }

        let count = metrics.len();
        let submission = MetricsSubmission {
            result_id: job.result_id,
            test_uuid: job.test_uuid,
            metrics,
        };
        self.collector
            .submit_metrics(job.token.as_deref(), &submission)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use meshplane_session_store::SelectedBoardConfig;
    use serde_json::json;

    use super::*;

    #[test]
    fn step_grows_with_window() {
        let cases = [
            (Duration::from_secs(30), 5),
            (Duration::from_secs(10 * MINUTE), 5),
            (Duration::from_secs(10 * MINUTE + 1), 10),
            (Duration::from_secs(45 * MINUTE), 20),
            (Duration::from_secs(2 * HOUR), MINUTE),
            (Duration::from_secs(5 * HOUR), 2 * MINUTE),
            (Duration::from_secs(12 * HOUR), 8 * MINUTE),
            (Duration::from_secs(10 * DAY), 2 * HOUR),
            (Duration::from_secs(400 * DAY), 4 * DAY),
            (Duration::from_secs(4000 * DAY), 30 * DAY),
        ];
        for (window, expected) in cases {
            assert_eq!(compute_step(window), Duration::from_secs(expected), "{window:?}");
        }
    }

    #[test]
    fn tracked_queries_are_distinct_panel_targets() {
        let config = PrometheusConfig {
            url: "http://prometheus:9090".to_string(),
            boards: vec![SelectedBoardConfig {
                board: None,
                panels: vec![
                    json!({"title": "Requests", "targets": [
                        {"expr": "sum(rate(istio_requests_total[1m]))"},
                        {"expr": "  "}
                    ]}),
                    json!({"title": "Again", "targets": [
                        {"expr": "sum(rate(istio_requests_total[1m]))"}
                    ]}),
                    json!({"title": "No targets"}),
                ],
                template_vars: Vec::new(),
            }],
        };
        assert_eq!(
            tracked_queries(&config),
            vec![TrackedQuery {
                panel: "Requests".to_string(),
                expr: "sum(rate(istio_requests_total[1m]))".to_string(),
            }]
        );
    }
}
