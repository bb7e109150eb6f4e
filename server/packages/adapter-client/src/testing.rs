//! Scripted in-memory adapters for exercising the control plane without a
//! network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    AdapterClient, AdapterConnector, AdapterError, AdapterEvent, ApplyOperationRequest, BoxFuture,
    ClusterContext, EventStream, OperationDescriptor,
};

#[derive(Debug)]
struct ScriptedAdapter {
    name: String,
    ops: Vec<OperationDescriptor>,
    reachable: bool,
    healthy: bool,
    probe_delay: Option<Duration>,
    connects: usize,
    probes: usize,
    closes: usize,
    streams: Vec<(u64, mpsc::UnboundedSender<Result<AdapterEvent, AdapterError>>)>,
    applied: Vec<ApplyOperationRequest>,
}

impl ScriptedAdapter {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ops: Vec::new(),
            reachable: true,
            healthy: true,
            probe_delay: None,
            connects: 0,
            probes: 0,
            closes: 0,
            streams: Vec::new(),
            applied: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    adapters: HashMap<String, ScriptedAdapter>,
}

/// Connector whose adapters are driven by the test.
///
/// Locations that were never registered with [`ScriptedConnector::add_adapter`]
/// refuse connections.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    next_client: Arc<AtomicU64>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_adapter(&self, location: &str, name: &str) {
        self.lock()
            .adapters
            .insert(location.to_string(), ScriptedAdapter::new(name));
    }

    pub fn set_operations(&self, location: &str, ops: Vec<OperationDescriptor>) {
        self.with_adapter(location, |adapter| adapter.ops = ops);
    }

    /// Unreachable adapters fail to connect.
    pub fn set_reachable(&self, location: &str, reachable: bool) {
        self.with_adapter(location, |adapter| adapter.reachable = reachable);
    }

    /// Unhealthy adapters accept connections but fail `identify`.
    pub fn set_healthy(&self, location: &str, healthy: bool) {
        self.with_adapter(location, |adapter| adapter.healthy = healthy);
    }

    pub fn set_probe_delay(&self, location: &str, delay: Option<Duration>) {
        self.with_adapter(location, |adapter| adapter.probe_delay = delay);
    }

    /// Pushes an event to every open stream for `location`; returns how many
    /// streams received it.
    pub fn emit(&self, location: &str, event: AdapterEvent) -> usize {
        self.with_adapter(location, |adapter| {
            adapter
                .streams
                .retain(|(_, sender)| sender.send(Ok(event.clone())).is_ok());
            adapter.streams.len()
        })
        .unwrap_or(0)
    }

    /// Fails every open stream for `location` with a transport-style error and
    /// ends it.
    pub fn fail_streams(&self, location: &str, message: &str) {
        self.with_adapter(location, |adapter| {
            for (_, sender) in adapter.streams.drain(..) {
                let _ = sender.send(Err(AdapterError::Unreachable(message.to_string())));
            }
        });
    }

    /// Ends every open stream for `location` cleanly.
    pub fn end_streams(&self, location: &str) {
        self.with_adapter(location, |adapter| adapter.streams.clear());
    }

    pub fn connect_count(&self, location: &str) -> usize {
        self.with_adapter(location, |adapter| adapter.connects)
            .unwrap_or(0)
    }

    pub fn probe_count(&self, location: &str) -> usize {
        self.with_adapter(location, |adapter| adapter.probes)
            .unwrap_or(0)
    }

    pub fn close_count(&self, location: &str) -> usize {
        self.with_adapter(location, |adapter| adapter.closes)
            .unwrap_or(0)
    }

    pub fn open_streams(&self, location: &str) -> usize {
        self.with_adapter(location, |adapter| {
            adapter.streams.retain(|(_, sender)| !sender.is_closed());
            adapter.streams.len()
        })
        .unwrap_or(0)
    }

    pub fn applied_operations(&self, location: &str) -> Vec<ApplyOperationRequest> {
        self.with_adapter(location, |adapter| adapter.applied.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_adapter<R>(
        &self,
        location: &str,
        f: impl FnOnce(&mut ScriptedAdapter) -> R,
    ) -> Option<R> {
        self.lock().adapters.get_mut(location).map(f)
    }
}

impl AdapterConnector for ScriptedConnector {
    fn connect<'a>(
        &'a self,
        location: &'a str,
        _cluster: &'a ClusterContext,
    ) -> BoxFuture<'a, Result<Arc<dyn AdapterClient>, AdapterError>> {
        Box::pin(async move {
            let reachable = self.with_adapter(location, |adapter| {
                adapter.connects += 1;
                adapter.reachable
            });
            match reachable {
                Some(true) => Ok(Arc::new(ScriptedClient {
                    id: self.next_client.fetch_add(1, Ordering::SeqCst),
                    location: location.to_string(),
                    connector: self.clone(),
                    closed: AtomicBool::new(false),
                }) as Arc<dyn AdapterClient>),
                _ => Err(AdapterError::Unreachable(format!(
                    "connection refused: {location}"
                ))),
            }
        })
    }
}

struct ScriptedClient {
    id: u64,
    location: String,
    connector: ScriptedConnector,
    closed: AtomicBool,
}

impl ScriptedClient {
    fn ensure_open(&self) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(AdapterError::Closed)
        } else {
            Ok(())
        }
    }

    fn missing(&self) -> AdapterError {
        AdapterError::Unreachable(format!("no adapter at {}", self.location))
    }
}

impl AdapterClient for ScriptedClient {
    fn location(&self) -> &str {
        &self.location
    }

    fn identify(&self) -> BoxFuture<'_, Result<String, AdapterError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let (delay, healthy, name) = self
                .connector
                .with_adapter(&self.location, |adapter| {
                    adapter.probes += 1;
                    (adapter.probe_delay, adapter.healthy, adapter.name.clone())
                })
                .ok_or_else(|| self.missing())?;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if healthy {
                Ok(name)
            } else {
                Err(AdapterError::Unreachable(format!(
                    "{} failed its health check",
                    self.location
                )))
            }
        })
    }

    fn supported_operations(
        &self,
    ) -> BoxFuture<'_, Result<Vec<OperationDescriptor>, AdapterError>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.connector
                .with_adapter(&self.location, |adapter| adapter.ops.clone())
                .ok_or_else(|| self.missing())
        })
    }

    fn apply_operation(
        &self,
        request: ApplyOperationRequest,
    ) -> BoxFuture<'_, Result<(), AdapterError>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.connector
                .with_adapter(&self.location, |adapter| adapter.applied.push(request))
                .ok_or_else(|| self.missing())
        })
    }

    fn stream_events(&self) -> BoxFuture<'_, Result<EventStream, AdapterError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let (tx, rx) = mpsc::unbounded_channel();
            self.connector
                .with_adapter(&self.location, |adapter| adapter.streams.push((self.id, tx)))
                .ok_or_else(|| self.missing())?;
            Ok(Box::pin(UnboundedReceiverStream::new(rx)) as EventStream)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let id = self.id;
            self.connector.with_adapter(&self.location, |adapter| {
                adapter.closes += 1;
                adapter.streams.retain(|(owner, _)| *owner != id);
            });
        })
    }
}
