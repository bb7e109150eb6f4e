//! Fan-in of adapter event streams onto one outward connection.
//!
//! Each registered client gets a listener task that forwards its events into
//! a bounded queue. A single writer task drains the queue and emits one
//! `data: <json>\n\n` frame per item. Listeners that outlive the session
//! never block: every enqueue races the listener's cancellation token, and a
//! closed queue ends the listener.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use meshplane_adapter_client::{AdapterClient, AdapterEvent};
use meshplane_error::MeshplaneError;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a listener stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The adapter closed its stream.
    Ended,
    /// The stream could not be opened or failed mid-flight.
    Failed(String),
    Cancelled,
    QueueClosed,
}

/// Reported to the owning loop once a listener has closed its client.
#[derive(Debug, Clone)]
pub struct ListenerExit {
    pub location: String,
    pub generation: u64,
    pub reason: ExitReason,
}

impl ListenerExit {
    /// The terminal stream error, if the adapter side ended the listener.
    pub fn error(&self) -> Option<MeshplaneError> {
        let message = match &self.reason {
            ExitReason::Ended => "adapter closed its event stream".to_string(),
            ExitReason::Failed(message) => message.clone(),
            ExitReason::Cancelled | ExitReason::QueueClosed => return None,
        };
        Some(MeshplaneError::StreamTerminated {
            location: self.location.clone(),
            message,
        })
    }
}

#[derive(Serialize)]
struct TaggedEvent<'a> {
    adapter: &'a str,
    #[serde(flatten)]
    event: &'a AdapterEvent,
}

/// Serializes `event` tagged with the adapter it came from.
pub fn encode_event(location: &str, event: &AdapterEvent) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(&TaggedEvent {
        adapter: location,
        event,
    })
    .map(Bytes::from)
}

/// Wraps an opaque payload in one server-sent-event frame.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_slice(b"data: ");
    buf.put_slice(payload);
    buf.put_slice(b"\n\n");
    buf.freeze()
}

pub fn frame_json<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(value).map(|payload| frame(&payload))
}

pub struct Aggregator {
    queue: Option<mpsc::Sender<Bytes>>,
    exits: mpsc::UnboundedSender<ListenerExit>,
    root: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

impl Aggregator {
    /// Spawns the writer task. Frames go to `outward` until its receiver is
    /// dropped or the queue closes and drains.
    pub fn new(
        capacity: usize,
        outward: mpsc::Sender<Bytes>,
    ) -> (Self, mpsc::UnboundedReceiver<ListenerExit>) {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(queue_rx, outward));
        (
            Self {
                queue: Some(queue_tx),
                exits: exits_tx,
                root: CancellationToken::new(),
                listeners: Vec::new(),
                writer,
            },
            exits_rx,
        )
    }

    /// Token for a new listener; cancelled individually on eviction and
    /// collectively on shutdown.
    pub fn listener_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Items currently buffered in the fan-in queue.
    pub fn queued(&self) -> usize {
        self.queue
            .as_ref()
            .map(|queue| queue.max_capacity() - queue.capacity())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.queue
            .as_ref()
            .map(|queue| queue.max_capacity())
            .unwrap_or(0)
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Opens the event stream on `client` and forwards it until the stream
    /// ends, errors, or `cancel` fires. The listener closes `client` itself
    /// before reporting its exit.
    pub fn spawn_listener(
        &mut self,
        location: String,
        generation: u64,
        client: Arc<dyn AdapterClient>,
        cancel: CancellationToken,
    ) {
        let Some(queue) = self.queue.clone() else {
            return;
        };
        let exits = self.exits.clone();
        self.listeners.retain(|handle| !handle.is_finished());
        self.listeners.push(tokio::spawn(async move {
            let reason = listen(&location, client.as_ref(), &cancel, &queue).await;
            drop(queue);
            client.close().await;
            let exit = ListenerExit {
                location,
                generation,
                reason,
            };
            match exit.error() {
                Some(err) => {
                    tracing::warn!(adapter = %exit.location, error = ?err, "adapter stream terminated")
                }
                None => {
                    tracing::debug!(adapter = %exit.location, reason = ?exit.reason, "listener stopped")
                }
            }
            let _ = exits.send(exit);
        }));
    }

    /// Cancels every listener, waits for them to finish, and closes the
    /// queue. The writer drains whatever is left and exits on its own.
    pub async fn shutdown(&mut self) {
        self.root.cancel();
        self.queue.take();
        for handle in self.listeners.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn writer_finished(&self) -> bool {
        self.writer.is_finished()
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn listen(
    location: &str,
    client: &dyn AdapterClient,
    cancel: &CancellationToken,
    queue: &mpsc::Sender<Bytes>,
) -> ExitReason {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return ExitReason::Cancelled,
        opened = client.stream_events() => match opened {
            Ok(stream) => stream,
            Err(err) => return ExitReason::Failed(err.to_string()),
        },
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExitReason::Cancelled,
            next = stream.next() => next,
        };
        let event = match next {
            None => return ExitReason::Ended,
            Some(Err(err)) => return ExitReason::Failed(err.to_string()),
            Some(Ok(event)) => event,
        };
        let payload = match encode_event(location, &event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(adapter = %location, error = %err, "dropping unencodable event");
                continue;
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExitReason::Cancelled,
            sent = queue.send(payload) => {
                if sent.is_err() {
                    return ExitReason::QueueClosed;
                }
            }
        }
    }
}

async fn run_writer(mut queue: mpsc::Receiver<Bytes>, outward: mpsc::Sender<Bytes>) {
    while let Some(payload) = queue.recv().await {
        if outward.send(frame(&payload)).await.is_err() {
            tracing::debug!("outward connection closed; writer exiting");
            queue.close();
            return;
        }
    }
    tracing::debug!("fan-in queue drained; writer exiting");
}

#[cfg(test)]
mod tests {
    use meshplane_adapter_client::EventKind;

    use super::*;

    fn exit(reason: ExitReason) -> ListenerExit {
        ListenerExit {
            location: "adapter-a".to_string(),
            generation: 1,
            reason,
        }
    }

    #[test]
    fn adapter_side_exits_are_stream_terminations() {
        let err = exit(ExitReason::Failed("connection reset".to_string()))
            .error()
            .expect("failed stream");
        assert!(matches!(
            err,
            MeshplaneError::StreamTerminated { ref location, ref message }
                if location == "adapter-a" && message == "connection reset"
        ));
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(problem.extensions["adapter"], "adapter-a");

        assert!(matches!(
            exit(ExitReason::Ended).error(),
            Some(MeshplaneError::StreamTerminated { .. })
        ));
    }

    #[test]
    fn local_exits_are_not_errors() {
        assert!(exit(ExitReason::Cancelled).error().is_none());
        assert!(exit(ExitReason::QueueClosed).error().is_none());
    }

    #[test]
    fn frames_payload_as_sse_data() {
        assert_eq!(&frame(b"{\"a\":1}")[..], b"data: {\"a\":1}\n\n");
    }

    #[test]
    fn encoded_event_is_tagged_with_adapter() {
        let event = AdapterEvent {
            event_type: EventKind::Warn,
            summary: "mesh degraded".to_string(),
            details: String::new(),
            operation_id: "op-1".to_string(),
        };
        let payload = encode_event("adapter-a", &event).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value["adapter"], "adapter-a");
        assert_eq!(value["eventType"], "warn");
        assert_eq!(value["summary"], "mesh degraded");
        assert_eq!(value["operationId"], "op-1");
    }
}
