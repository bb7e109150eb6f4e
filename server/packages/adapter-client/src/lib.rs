//! Client side of the adapter RPC surface.
//!
//! The control plane only ever talks to adapters through [`AdapterConnector`]
//! and [`AdapterClient`]. [`http`] binds them to JSON-RPC over HTTP with an
//! SSE event stream; [`testing`] provides a scripted in-memory adapter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

mod error;
pub mod http;
pub mod sse;
pub mod testing;
mod types;

pub use error::AdapterError;
pub use types::{
    AdapterEvent, ApplyOperationRequest, ClusterContext, EventKind, OperationDescriptor,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Server-push events from one adapter, in the order the adapter sent them.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<AdapterEvent, AdapterError>> + Send>>;

/// A live handle to one remote adapter.
pub trait AdapterClient: Send + Sync + 'static {
    fn location(&self) -> &str;

    /// Cheap liveness probe; resolves to the adapter's mesh name.
    fn identify(&self) -> BoxFuture<'_, Result<String, AdapterError>>;

    fn supported_operations(&self) -> BoxFuture<'_, Result<Vec<OperationDescriptor>, AdapterError>>;

    fn apply_operation(
        &self,
        request: ApplyOperationRequest,
    ) -> BoxFuture<'_, Result<(), AdapterError>>;

    /// Opens the continuous event stream. The stream ends when the adapter
    /// closes it, on a transport error, or once [`AdapterClient::close`] runs.
    fn stream_events(&self) -> BoxFuture<'_, Result<EventStream, AdapterError>>;

    /// Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Opens [`AdapterClient`]s for adapter locations.
pub trait AdapterConnector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        location: &'a str,
        cluster: &'a ClusterContext,
    ) -> BoxFuture<'a, Result<Arc<dyn AdapterClient>, AdapterError>>;
}
