//! Per-connection reconciliation of declared adapters against live clients.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use meshplane_adapter_client::{AdapterClient, AdapterConnector, AdapterError, ClusterContext};
use meshplane_session_store::{ClusterAccess, Session, SessionStore};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Aggregator, ListenerExit};
use crate::pool::Pool;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_FAN_IN_CAPACITY: usize = 100;
const OUTWARD_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub fan_in_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            fan_in_capacity: DEFAULT_FAN_IN_CAPACITY,
        }
    }
}

/// What one tick changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub connected: Vec<String>,
    pub connect_failed: Vec<String>,
    pub evicted: Vec<String>,
    /// Everything was closed because the session has no usable cluster
    /// access or no adapters.
    pub torn_down: bool,
}

pub struct Reconciler {
    user_id: String,
    store: Arc<SessionStore>,
    connector: Arc<dyn AdapterConnector>,
    config: ReconcileConfig,
    pool: Pool,
    aggregator: Aggregator,
    exits: mpsc::UnboundedReceiver<ListenerExit>,
    outward: mpsc::Sender<Bytes>,
}

impl Reconciler {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<SessionStore>,
        connector: Arc<dyn AdapterConnector>,
        config: ReconcileConfig,
        outward: mpsc::Sender<Bytes>,
    ) -> Self {
        let (aggregator, exits) = Aggregator::new(config.fan_in_capacity, outward.clone());
        Self {
            user_id: user_id.into(),
            store,
            connector,
            config,
            pool: Pool::new(),
            aggregator,
            exits,
            outward,
        }
    }

    pub fn live_locations(&self) -> Vec<String> {
        self.pool.locations()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Ticks immediately and then every interval until the outward receiver
    /// is dropped or `shutdown` fires, then tears the pipeline down.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let outward = self.outward.clone();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = outward.closed() => {
                    tracing::debug!(user = %self.user_id, "outward connection closed");
                    break;
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!(user = %self.user_id, "server shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.connected.is_empty() || !report.evicted.is_empty() {
                        tracing::info!(
                            user = %self.user_id,
                            connected = ?report.connected,
                            evicted = ?report.evicted,
                            live = self.pool.len(),
                            "reconciled adapters"
                        );
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// One full reconciliation pass against a freshly read session.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        self.reap_exits();

        let session = match self.store.read(&self.user_id).await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(user = %self.user_id, error = %err, "unable to read session");
                Session::default()
            }
        };

        let Some(cluster) = session.valid_cluster() else {
            tracing::debug!(user = %self.user_id, "no valid kubernetes config found");
            report.evicted = self.evict_all().await;
            report.torn_down = true;
            return report;
        };
        let declared = declared_locations(&session);
        if declared.is_empty() {
            tracing::debug!(user = %self.user_id, "no adapters configured");
            report.evicted = self.evict_all().await;
            report.torn_down = true;
            return report;
        }

        let declared_set: HashSet<&str> = declared.iter().map(String::as_str).collect();
        for location in self.pool.locations() {
            if !declared_set.contains(location.as_str()) {
                self.evict(&location).await;
                report.evicted.push(location);
            }
        }

        // Locations evicted by the probes below reconnect next tick, not this one.
        let missing: Vec<String> = declared
            .iter()
            .filter(|location| !self.pool.contains(location))
            .cloned()
            .collect();

        let live: Vec<(String, Arc<dyn AdapterClient>)> = declared
            .iter()
            .filter_map(|location| {
                self.pool
                    .get(location)
                    .map(|live| (location.clone(), live.client.clone()))
            })
            .collect();
        let probe_timeout = self.config.probe_timeout;
        let probes = join_all(
            live.iter()
                .map(|(_, client)| probe(client.as_ref(), probe_timeout)),
        )
        .await;
        for ((location, _), result) in live.into_iter().zip(probes) {
            if let Err(err) = result {
                tracing::warn!(adapter = %location, error = %err, "liveness probe failed; evicting");
                self.evict(&location).await;
                report.evicted.push(location);
            }
        }

        if missing.is_empty() {
            return report;
        }

        let context = cluster_context(cluster);
        let connector = self.connector.clone();
        let attempts = join_all(
            missing.iter().map(|location| {
                connect_and_probe(connector.as_ref(), location, &context, probe_timeout)
            }),
        )
        .await;

        for (location, attempt) in missing.into_iter().zip(attempts) {
            match attempt {
                Ok(client) => {
                    let cancel = self.aggregator.listener_token();
                    let (generation, previous) =
                        self.pool.insert(&location, client.clone(), cancel.clone());
                    if let Some(previous) = previous {
                        previous.shutdown().await;
                    }
                    self.aggregator
                        .spawn_listener(location.clone(), generation, client, cancel);
                    tracing::debug!(adapter = %location, "adapter connected");
                    report.connected.push(location);
                }
                Err(err) => {
                    tracing::debug!(adapter = %location, error = %err, "adapter unreachable");
                    report.connect_failed.push(location);
                }
            }
        }

        report
    }

    /// Cancels every listener, closes every live client and closes the
    /// fan-in queue.
    pub async fn teardown(&mut self) {
        self.aggregator.shutdown().await;
        for (_, live) in self.pool.drain() {
            live.shutdown().await;
        }
        self.reap_exits();
    }

    /// Drops registrations whose listener has already exited. The client was
    /// closed by the listener; the location reconnects on this tick if it is
    /// still declared.
    fn reap_exits(&mut self) {
        while let Ok(exit) = self.exits.try_recv() {
            if let Some(live) = self.pool.remove_generation(&exit.location, exit.generation) {
                live.cancel.cancel();
                tracing::debug!(adapter = %exit.location, reason = ?exit.reason, "dropping exited listener");
            }
        }
    }

    async fn evict(&mut self, location: &str) {
        if let Some(live) = self.pool.remove(location) {
            live.shutdown().await;
        }
    }

    async fn evict_all(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut drained = self.pool.drain();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        for (location, live) in drained {
            live.shutdown().await;
            evicted.push(location);
        }
        evicted
    }
}

/// Declared locations in session order, without blanks or duplicates.
pub fn declared_locations(session: &Session) -> Vec<String> {
    let mut seen = HashSet::new();
    session
        .adapters
        .iter()
        .map(|adapter| adapter.location.trim())
        .filter(|location| !location.is_empty())
        .filter(|location| seen.insert(location.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn cluster_context(cluster: &ClusterAccess) -> ClusterContext {
    ClusterContext {
        in_cluster: cluster.in_cluster,
        kubeconfig: cluster.config.clone(),
        context_name: cluster.context_name.clone(),
    }
}

async fn probe(client: &dyn AdapterClient, timeout: Duration) -> Result<String, AdapterError> {
    tokio::time::timeout(timeout, client.identify())
        .await
        .map_err(|_| AdapterError::Timeout)?
}

async fn connect_and_probe(
    connector: &dyn AdapterConnector,
    location: &str,
    context: &ClusterContext,
    timeout: Duration,
) -> Result<Arc<dyn AdapterClient>, AdapterError> {
    let client = tokio::time::timeout(timeout, connector.connect(location, context))
        .await
        .map_err(|_| AdapterError::Timeout)??;
    match probe(client.as_ref(), timeout).await {
        Ok(_) => Ok(client),
        Err(err) => {
            client.close().await;
            Err(err)
        }
    }
}

/// Starts the reconciliation pipeline for `user_id` and returns the receiver
/// of framed output. Dropping the receiver tears the pipeline down.
pub fn spawn_event_stream(
    user_id: String,
    store: Arc<SessionStore>,
    connector: Arc<dyn AdapterConnector>,
    config: ReconcileConfig,
    shutdown: CancellationToken,
) -> mpsc::Receiver<Bytes> {
    let (outward_tx, outward_rx) = mpsc::channel(OUTWARD_BUFFER);
    tokio::spawn(async move {
        let reconciler = Reconciler::new(user_id, store, connector, config, outward_tx);
        reconciler.run(shutdown).await;
    });
    outward_rx
}

#[cfg(test)]
mod tests {
    use meshplane_session_store::Adapter;

    use super::*;

    #[test]
    fn declared_locations_skip_blanks_and_duplicates() {
        let session = Session {
            adapters: vec![
                Adapter::at("adapter-b"),
                Adapter::at(""),
                Adapter::at("adapter-a"),
                Adapter::at("adapter-b"),
                Adapter::at("  "),
            ],
            ..Session::default()
        };
        assert_eq!(declared_locations(&session), vec!["adapter-b", "adapter-a"]);
    }
}
