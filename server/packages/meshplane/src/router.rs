use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use meshplane_adapter_client::{
    AdapterClient, AdapterConnector, AdapterError, ApplyOperationRequest,
};
use meshplane_error::{MeshplaneError, ProblemDetails};
use meshplane_session_store::{Adapter, Session, SessionStore, StoreError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::load_test::{LoadTestOptions, LoadTestRunner};
use crate::reconcile::{cluster_context, spawn_event_stream, ReconcileConfig};

mod types;

pub use types::*;

/// Set by the upstream auth layer to the authenticated user's id.
pub const USER_HEADER: &str = "x-meshplane-user";
/// Results-collector token forwarded with published results.
pub const TOKEN_HEADER: &str = "x-meshplane-token";
const DEFAULT_NAMESPACE: &str = "default";

pub struct AppState {
    store: Arc<SessionStore>,
    connector: Arc<dyn AdapterConnector>,
    load_tests: Arc<LoadTestRunner>,
    reconcile: ReconcileConfig,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        store: Arc<SessionStore>,
        connector: Arc<dyn AdapterConnector>,
        load_tests: Arc<LoadTestRunner>,
        reconcile: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            connector,
            load_tests,
            reconcile,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Stops every streaming session and background job.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/session",
            get(get_session).put(put_session).delete(delete_session),
        )
        .route(
            "/mesh/adapters",
            get(list_adapters).post(add_adapter).delete(remove_adapter),
        )
        .route("/mesh/adapters/ping", get(ping_adapter))
        .route("/mesh/ops", post(apply_operation))
        .route("/events", get(stream_events))
        .route("/load-test", get(run_load_test))
        .with_state(state);

    Router::new()
        .route("/v1/health", get(get_health))
        .nest("/api", api)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
                tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
            }),
        )
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Meshplane(#[from] MeshplaneError),
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        if !matches!(value, StoreError::EmptyUserId) {
            tracing::error!(error = %value, "session store failure");
        }
        Self::Meshplane(value.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Meshplane(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn user_id(headers: &HeaderMap) -> Result<String, MeshplaneError> {
    header_value(headers, USER_HEADER).ok_or_else(|| MeshplaneError::Unauthorized {
        message: Some(format!("missing {USER_HEADER} header")),
    })
}

fn adapter_failure(location: &str, err: AdapterError) -> MeshplaneError {
    match err {
        AdapterError::Timeout => MeshplaneError::Timeout {
            message: Some(format!("adapter {location} did not respond in time")),
        },
        err => MeshplaneError::AdapterUnreachable {
            location: location.to_string(),
            message: err.to_string(),
        },
    }
}

fn stream_response(frames: mpsc::Receiver<Bytes>) -> Response {
    let body = Body::from_stream(ReceiverStream::new(frames).map(Ok::<_, Infallible>));
    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
            (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response()
}

async fn connect(
    state: &AppState,
    session: &Session,
    location: &str,
) -> Result<Arc<dyn AdapterClient>, MeshplaneError> {
    let cluster = session
        .valid_cluster()
        .ok_or(MeshplaneError::ConfigInvalid { message: None })?;
    state
        .connector
        .connect(location, &cluster_context(cluster))
        .await
        .map_err(|err| adapter_failure(location, err))
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Session>, ApiError> {
    let user = user_id(&headers)?;
    Ok(Json(state.store.read(&user).await?))
}

async fn put_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<Option<Session>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let user = user_id(&headers)?;
    let Json(session) = payload.map_err(|err| MeshplaneError::invalid_request(err.body_text()))?;
    let session =
        session.ok_or_else(|| MeshplaneError::invalid_request("session must not be null"))?;
    state.store.write(&user, &session).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = user_id(&headers)?;
    state.store.delete(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_adapters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Adapter>>, ApiError> {
    let user = user_id(&headers)?;
    Ok(Json(state.store.read(&user).await?.adapters))
}

async fn add_adapter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<AddAdapterRequest>, JsonRejection>,
) -> Result<Json<Vec<Adapter>>, ApiError> {
    let user = user_id(&headers)?;
    let Json(request) = payload.map_err(|err| MeshplaneError::invalid_request(err.body_text()))?;
    let location = request.mesh_location_url.trim();
    if location.is_empty() {
        return Err(MeshplaneError::invalid_request("meshLocationURL is required").into());
    }

    let mut session = state.store.read(&user).await?;
    if session.find_adapter(location).is_some() {
        return Ok(Json(session.adapters));
    }

    let client = connect(&state, &session, location).await?;
    let described = async {
        let ops = client.supported_operations().await?;
        let name = client.identify().await?;
        Ok::<_, AdapterError>((name, ops))
    }
    .await;
    client.close().await;
    let (name, ops) = described.map_err(|err| adapter_failure(location, err))?;

    session.adapters.push(Adapter {
        location: location.to_string(),
        name,
        ops: ops.into_iter().map(|op| op.key).collect(),
    });
    state.store.write(&user, &session).await?;
    tracing::info!(user = %user, adapter = %location, "adapter added");
    Ok(Json(session.adapters))
}

async fn remove_adapter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdapterQuery>,
) -> Result<Json<Vec<Adapter>>, ApiError> {
    let user = user_id(&headers)?;
    let location = query.adapter.trim();
    let mut session = state.store.read(&user).await?;
    if location.is_empty() || session.find_adapter(location).is_none() {
        return Err(MeshplaneError::AdapterNotFound {
            location: location.to_string(),
        }
        .into());
    }
    session.adapters.retain(|adapter| adapter.location != location);
    state.store.write(&user, &session).await?;
    tracing::info!(user = %user, adapter = %location, "adapter removed");
    Ok(Json(session.adapters))
}

async fn ping_adapter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdapterQuery>,
) -> Result<Json<PingResponse>, ApiError> {
    let user = user_id(&headers)?;
    let location = query.adapter.trim();
    let session = state.store.read(&user).await?;
    if location.is_empty() || session.find_adapter(location).is_none() {
        return Err(MeshplaneError::AdapterNotFound {
            location: location.to_string(),
        }
        .into());
    }

    let client = connect(&state, &session, location).await?;
    let identified =
        tokio::time::timeout(state.reconcile.probe_timeout, client.identify()).await;
    client.close().await;
    let name = match identified {
        Ok(result) => result.map_err(|err| adapter_failure(location, err))?,
        Err(_) => return Err(adapter_failure(location, AdapterError::Timeout).into()),
    };
    Ok(Json(PingResponse {
        adapter: location.to_string(),
        name,
    }))
}

async fn apply_operation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ApplyOperationBody>, JsonRejection>,
) -> Result<Json<ApplyOperationResponse>, ApiError> {
    let user = user_id(&headers)?;
    let Json(body) = payload.map_err(|err| MeshplaneError::invalid_request(err.body_text()))?;
    let location = body.adapter.trim();
    if body.query.trim().is_empty() {
        return Err(MeshplaneError::invalid_request("query is required").into());
    }

    let session = state.store.read(&user).await?;
    if location.is_empty() || session.find_adapter(location).is_none() {
        return Err(MeshplaneError::AdapterNotFound {
            location: location.to_string(),
        }
        .into());
    }

    let operation_id = uuid::Uuid::new_v4().to_string();
    let namespace = body
        .namespace
        .as_deref()
        .map(str::trim)
        .filter(|namespace| !namespace.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE)
        .to_string();
    let request = ApplyOperationRequest {
        operation_id: operation_id.clone(),
        op_name: body.query.trim().to_string(),
        username: user.clone(),
        namespace,
        custom_body: body.custom_body,
        delete_op: body.delete_op,
    };

    let client = connect(&state, &session, location).await?;
    let applied = client.apply_operation(request).await;
    client.close().await;
    applied.map_err(|err| adapter_failure(location, err))?;

    tracing::info!(user = %user, adapter = %location, operation_id = %operation_id, "operation submitted");
    Ok(Json(ApplyOperationResponse { operation_id }))
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    tracing::debug!(user = %user, "event stream opened");
    let frames = spawn_event_stream(
        user,
        state.store.clone(),
        state.connector.clone(),
        state.reconcile,
        state.shutdown.child_token(),
    );
    Ok(stream_response(frames))
}

async fn run_load_test(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let options = LoadTestOptions::from_query(&params).map_err(MeshplaneError::from)?;
    let session = state.store.read(&user).await?;
    let token = header_value(&headers, TOKEN_HEADER);
    tracing::info!(user = %user, name = %options.name, url = %options.url, "load test requested");
    let frames = state.load_tests.clone().spawn(options, session, token);
    Ok(stream_response(frames))
}
