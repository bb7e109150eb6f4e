use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use meshplane_adapter_client::http::HttpConnector;
use meshplane_session_store::SessionStore;
use reqwest::Client;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::load_test::{HttpClusterInspector, HttpLoadGenerator, LoadTestRunner};
use crate::metrics::{MetricsWorker, DEFAULT_JOB_CAPACITY, DEFAULT_QUERY_TIMEOUT};
use crate::reconcile::{
    ReconcileConfig, DEFAULT_FAN_IN_CAPACITY, DEFAULT_INTERVAL, DEFAULT_PROBE_TIMEOUT,
};
use crate::results::{CollectorError, ResultsCollector};
use crate::router::{build_router, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9081;
const DEFAULT_TOKEN_NAME: &str = "meshplane_results";
const ADAPTER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "meshplane", bin_name = "meshplane")]
#[command(about = "Service mesh adapter control plane", version)]
#[command(arg_required_else_help = true)]
pub struct MeshplaneCli {
    #[command(subcommand)]
    command: Command,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true, env = "MESHPLANE_DEBUG")]
    debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control plane HTTP server.
    Server(ServerArgs),
    /// Check that a running server answers its health endpoint.
    Health(HealthArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "MESHPLANE_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding the session database.
    #[arg(long, env = "USER_DATA_FOLDER")]
    data_dir: Option<PathBuf>,

    /// Base URL of the results collector.
    #[arg(long, env = "RESULTS_BASE_URL")]
    results_url: String,

    /// Cookie name the collector expects its token under.
    #[arg(long, env = "RESULTS_TOKEN_NAME", default_value = DEFAULT_TOKEN_NAME)]
    token_name: String,

    #[arg(long, default_value_t = DEFAULT_INTERVAL.as_secs())]
    reconcile_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_FAN_IN_CAPACITY)]
    fan_in_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_millis() as u64)]
    probe_timeout_ms: u64,
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    #[arg(long, short = 'e', default_value = "http://127.0.0.1:9081")]
    endpoint: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store error: {0}")]
    Store(#[from] meshplane_session_store::StoreError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run_meshplane() -> Result<(), CliError> {
    let cli = MeshplaneCli::parse();
    init_logging(cli.debug);
    match &cli.command {
        Command::Server(args) => run_server(args),
        Command::Health(args) => run_health(args),
    }
}

pub fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

impl ServerArgs {
    fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms.max(1)),
            fan_in_capacity: self.fan_in_capacity.max(1),
        }
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let data_dir = server.data_dir.clone().unwrap_or_else(default_data_dir);
        let store = Arc::new(SessionStore::open(&data_dir).await?);

        let http = Client::new();
        let collector = ResultsCollector::new(http.clone(), &server.results_url, &server.token_name)?;
        let connector = Arc::new(HttpConnector::with_client(
            http.clone(),
            ADAPTER_REQUEST_TIMEOUT,
        ));

        let shutdown = tokio_util::sync::CancellationToken::new();
        let (metrics, metrics_worker) =
            MetricsWorker::new(http.clone(), collector.clone(), DEFAULT_QUERY_TIMEOUT)
                .spawn(DEFAULT_JOB_CAPACITY, shutdown.clone());
        let load_tests = Arc::new(LoadTestRunner::new(
            Arc::new(HttpLoadGenerator::new(http.clone())),
            Arc::new(HttpClusterInspector::new(http)),
            collector,
            Some(metrics),
        ));

        let state = Arc::new(AppState::new(
            store.clone(),
            connector,
            load_tests,
            server.reconcile_config(),
        ));
        let streams = state.shutdown_token();
        let router = build_router(state).layer(build_cors_layer());

        let addr = format!("{}:{}", server.host, server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                streams.cancel();
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));

        shutdown.cancel();
        let _ = metrics_worker.await;
        store.close().await;
        served
    })
}

fn run_health(args: &HealthArgs) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let url = format!("{}/v1/health", args.endpoint.trim_end_matches('/'));
        let response = Client::new().get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CliError::HttpStatus(status));
        }
        println!("{}", response.text().await?);
        Ok(())
    })
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("meshplane").join("config"))
        .unwrap_or_else(|| PathBuf::from(".").join(".meshplane").join("config"))
}
