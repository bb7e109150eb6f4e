use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use meshplane_adapter_client::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;

use super::{LoadGeneratorKind, LoadTestError, LoadTestOptions};

/// Latencies in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub generator: LoadGeneratorKind,
    pub url: String,
    pub start_time: DateTime<Utc>,
    pub requested_duration_secs: u64,
    pub actual_duration_ms: u64,
    pub concurrency: usize,
    pub requested_qps: f64,
    pub actual_qps: f64,
    pub total_requests: u64,
    pub errors: u64,
    pub latency: LatencySummary,
    /// Response count per HTTP status code.
    pub status_codes: BTreeMap<u16, u64>,
}

impl LoadSummary {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + chrono::Duration::milliseconds(self.actual_duration_ms as i64)
    }
}

/// Runs the traffic phase of a load test and waits for it to finish.
pub trait LoadGenerator: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        options: &'a LoadTestOptions,
    ) -> BoxFuture<'a, Result<LoadSummary, LoadTestError>>;
}

/// Closed-loop HTTP GET generator: `concurrency` workers, each paced to its
/// share of the target rate.
#[derive(Debug, Clone)]
pub struct HttpLoadGenerator {
    http: Client,
}

impl HttpLoadGenerator {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[derive(Default)]
struct WorkerTally {
    latencies_ms: Vec<f64>,
    errors: u64,
    status_codes: BTreeMap<u16, u64>,
}

impl LoadGenerator for HttpLoadGenerator {
    fn run<'a>(
        &'a self,
        options: &'a LoadTestOptions,
    ) -> BoxFuture<'a, Result<LoadSummary, LoadTestError>> {
        Box::pin(async move {
            if options.duration.is_zero() {
                return Err(LoadTestError::Generator("duration must be positive".to_string()));
            }
            let workers = options.concurrency.max(1);
            let pace = if options.qps > 0.0 {
                let period = Duration::try_from_secs_f64(workers as f64 / options.qps)
                    .map_err(|_| {
                        LoadTestError::Generator(format!(
                            "qps {} is too low to pace {workers} workers",
                            options.qps
                        ))
                    })?;
                // A period past the deadline still yields the first request.
                Some(period.min(options.duration))
            } else {
                None
            };

            let start_time = Utc::now();
            let started = Instant::now();
            let deadline = tokio::time::Instant::now()
                .checked_add(options.duration)
                .ok_or_else(|| {
                    LoadTestError::Generator(format!(
                        "duration of {}s is out of range",
                        options.duration.as_secs()
                    ))
                })?;
            tracing::info!(
                url = %options.url,
                workers,
                qps = options.qps,
                duration_secs = options.duration.as_secs(),
                "load generation started"
            );

            let tallies = join_all(
                (0..workers).map(|_| self.worker(options.url.as_str(), deadline, pace)),
            )
            .await;
            let elapsed = started.elapsed();

            let mut latencies = Vec::new();
            let mut errors = 0;
            let mut status_codes = BTreeMap::new();
            for tally in tallies {
                latencies.extend(tally.latencies_ms);
                errors += tally.errors;
                for (code, count) in tally.status_codes {
                    *status_codes.entry(code).or_insert(0) += count;
                }
            }
            let total_requests = latencies.len() as u64 + errors;
            if latencies.is_empty() {
                return Err(LoadTestError::Generator(format!(
                    "no successful requests against {} ({errors} errors)",
                    options.url
                )));
            }

            let actual_qps = total_requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            Ok(LoadSummary {
                generator: options.generator,
                url: options.url.to_string(),
                start_time,
                requested_duration_secs: options.duration.as_secs(),
                actual_duration_ms: elapsed.as_millis() as u64,
                concurrency: workers,
                requested_qps: options.qps,
                actual_qps,
                total_requests,
                errors,
                latency: summarize(&mut latencies),
                status_codes,
            })
        })
    }
}

impl HttpLoadGenerator {
    async fn worker(
        &self,
        url: &str,
        deadline: tokio::time::Instant,
        pace: Option<Duration>,
    ) -> WorkerTally {
        let mut tally = WorkerTally::default();
        let mut ticker = pace.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            if let Some(ticker) = ticker.as_mut() {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = ticker.tick() => {}
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }

            let sent = Instant::now();
            let response = self
                .http
                .get(url)
                .timeout(deadline.saturating_duration_since(now))
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status().as_u16();
                    // Drain the body so the connection is reused.
                    let _ = response.bytes().await;
                    *tally.status_codes.entry(status).or_insert(0) += 1;
                    if status < 400 {
                        tally.latencies_ms.push(sent.elapsed().as_secs_f64() * 1000.0);
                    } else {
                        tally.errors += 1;
                    }
                }
                Err(err) if err.is_timeout() => break,
                Err(err) => {
                    tracing::debug!(error = %err, "load request failed");
                    tally.errors += 1;
                }
            }
        }
        tally
    }
}

fn summarize(latencies: &mut [f64]) -> LatencySummary {
    if latencies.is_empty() {
        return LatencySummary::default();
    }
    latencies.sort_by(|a, b| a.total_cmp(b));
    let percentile = |p: f64| {
        let rank = ((p / 100.0) * latencies.len() as f64).ceil() as usize;
        latencies[rank.clamp(1, latencies.len()) - 1]
    };
    LatencySummary {
        min_ms: latencies[0],
        mean_ms: latencies.iter().sum::<f64>() / latencies.len() as f64,
        p50_ms: percentile(50.0),
        p90_ms: percentile(90.0),
        p99_ms: percentile(99.0),
        max_ms: latencies[latencies.len() - 1],
    }
}
