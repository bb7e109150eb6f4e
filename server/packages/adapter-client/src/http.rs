//! JSON-RPC over HTTP binding for adapters.
//!
//! Calls are `POST <location>/v1/rpc` with a JSON-RPC 2.0 envelope. Events are
//! read from `GET <location>/v1/events` as server-sent events whose `data:`
//! payload is one JSON [`AdapterEvent`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::sse::SseDecoder;
use crate::{
    AdapterClient, AdapterConnector, AdapterError, AdapterEvent, ApplyOperationRequest, BoxFuture,
    ClusterContext, EventStream, OperationDescriptor,
};

const RPC_PATH: &str = "v1/rpc";
const EVENTS_PATH: &str = "v1/events";

#[derive(Debug, Clone)]
pub struct HttpConnector {
    http: Client,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            request_timeout,
        }
    }

    pub fn with_client(http: Client, request_timeout: Duration) -> Self {
        Self {
            http,
            request_timeout,
        }
    }
}

impl AdapterConnector for HttpConnector {
    fn connect<'a>(
        &'a self,
        location: &'a str,
        cluster: &'a ClusterContext,
    ) -> BoxFuture<'a, Result<Arc<dyn AdapterClient>, AdapterError>> {
        Box::pin(async move {
            let client = HttpAdapterClient::new(
                location,
                self.http.clone(),
                self.request_timeout,
            )?;
            client.configure(cluster).await?;
            tracing::debug!(adapter = location, "adapter client connected");
            Ok(Arc::new(client) as Arc<dyn AdapterClient>)
        })
    }
}

pub struct HttpAdapterClient {
    location: String,
    base: Url,
    http: Client,
    request_timeout: Duration,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl HttpAdapterClient {
    pub fn new(
        location: &str,
        http: Client,
        request_timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let base = base_url(location)?;
        Ok(Self {
            location: location.to_string(),
            base,
            http,
            request_timeout,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    async fn configure(&self, cluster: &ClusterContext) -> Result<(), AdapterError> {
        let params = json!({
            "kubeconfig": base64::engine::general_purpose::STANDARD.encode(&cluster.kubeconfig),
            "contextName": cluster.context_name,
            "inCluster": cluster.in_cluster,
        });
        self.call("adapter/configure", params).await.map(|_| ())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        let url = self.endpoint(RPC_PATH)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(&envelope)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Status {
                method: method.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let reply: RpcReply = response.json().await.map_err(map_send_error)?;
        if let Some(error) = reply.error {
            return Err(AdapterError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    fn endpoint(&self, path: &str) -> Result<Url, AdapterError> {
        self.base
            .join(path)
            .map_err(|err| AdapterError::InvalidLocation {
                location: self.location.clone(),
                message: err.to_string(),
            })
    }
}

impl AdapterClient for HttpAdapterClient {
    fn location(&self) -> &str {
        &self.location
    }

    fn identify(&self) -> BoxFuture<'_, Result<String, AdapterError>> {
        Box::pin(async move {
            let result = self.call("adapter/identify", json!({})).await?;
            let identity: Identity = serde_json::from_value(result)?;
            Ok(identity.name)
        })
    }

    fn supported_operations(
        &self,
    ) -> BoxFuture<'_, Result<Vec<OperationDescriptor>, AdapterError>> {
        Box::pin(async move {
            let result = self
                .call("adapter/supported_operations", json!({}))
                .await?;
            let ops: SupportedOperations = serde_json::from_value(result)?;
            Ok(ops.ops)
        })
    }

    fn apply_operation(
        &self,
        request: ApplyOperationRequest,
    ) -> BoxFuture<'_, Result<(), AdapterError>> {
        Box::pin(async move {
            let params = serde_json::to_value(&request)?;
            self.call("adapter/apply_operation", params).await?;
            Ok(())
        })
    }

    fn stream_events(&self) -> BoxFuture<'_, Result<EventStream, AdapterError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AdapterError::Closed);
            }
            let url = self.endpoint(EVENTS_PATH)?;
            let response = self
                .http
                .get(url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await
                .map_err(map_send_error)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AdapterError::Status {
                    method: "events".to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            let state = StreamState {
                body: Box::pin(response.bytes_stream()),
                decoder: SseDecoder::new(),
                pending: Default::default(),
                shutdown: self.shutdown.clone(),
                done: false,
            };
            let stream = futures::stream::unfold(state, next_event);
            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.shutdown.cancel();
                tracing::debug!(adapter = %self.location, "adapter client closed");
            }
        })
    }
}

type ByteStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

struct StreamState {
    body: ByteStream,
    decoder: SseDecoder,
    pending: std::collections::VecDeque<String>,
    shutdown: CancellationToken,
    done: bool,
}

async fn next_event(
    mut state: StreamState,
) -> Option<(Result<AdapterEvent, AdapterError>, StreamState)> {
    loop {
        if let Some(payload) = state.pending.pop_front() {
            let event = serde_json::from_str::<AdapterEvent>(&payload).map_err(AdapterError::from);
            return Some((event, state));
        }
        if state.done {
            return None;
        }

        let chunk = tokio::select! {
            _ = state.shutdown.cancelled() => return None,
            chunk = state.body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => state.pending.extend(state.decoder.push(&bytes)),
            Some(Err(err)) => {
                state.done = true;
                return Some((Err(AdapterError::Transport(err)), state));
            }
            None => state.done = true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Identity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SupportedOperations {
    #[serde(default)]
    ops: Vec<OperationDescriptor>,
}

fn map_send_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else if err.is_connect() {
        AdapterError::Unreachable(err.to_string())
    } else {
        AdapterError::Transport(err)
    }
}

/// Adapter locations are usually bare `host:port`; those are served over
/// plain HTTP. The returned URL always ends in `/` so relative joins keep
/// any path prefix.
fn base_url(location: &str) -> Result<Url, AdapterError> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(AdapterError::InvalidLocation {
            location: location.to_string(),
            message: "location is empty".to_string(),
        });
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let with_slash = if with_scheme.ends_with('/') {
        with_scheme
    } else {
        format!("{with_scheme}/")
    };
    let url = Url::parse(&with_slash).map_err(|err| AdapterError::InvalidLocation {
        location: location.to_string(),
        message: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AdapterError::InvalidLocation {
            location: location.to_string(),
            message: format!("unsupported scheme `{other}`"),
        }),
    }
}
