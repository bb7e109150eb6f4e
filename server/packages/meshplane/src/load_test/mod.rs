//! Load-test orchestration: run a generator, enrich the result with cluster
//! facts, publish it, and schedule the metrics follow-up.

mod generator;
mod inspector;
mod options;
mod runner;

use meshplane_error::MeshplaneError;
use meshplane_session_store::ClusterNode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::results::CollectorError;

pub use generator::{HttpLoadGenerator, LatencySummary, LoadGenerator, LoadSummary};
pub use inspector::{ClusterInspector, DetectedAdapter, HttpClusterInspector};
pub use options::{LoadGeneratorKind, LoadTestOptions};
pub use runner::{LoadTestRunner, RunStatus, StatusEvent};

#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error("invalid load test option `{field}`: {message}")]
    InvalidOption { field: &'static str, message: String },
    #[error("load generator failed: {0}")]
    Generator(String),
    #[error("unable to look up {what}: {message}")]
    Inspect { what: &'static str, message: String },
    #[error("unable to encode load test result: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Publish(#[from] CollectorError),
}

impl LoadTestError {
    pub(crate) fn option(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            field,
            message: message.into(),
        }
    }
}

impl From<LoadTestError> for MeshplaneError {
    fn from(value: LoadTestError) -> Self {
        match value {
            LoadTestError::InvalidOption { .. } => MeshplaneError::invalid_request(value.to_string()),
            LoadTestError::Publish(err) => err.into(),
            other => MeshplaneError::LoadTestFailed {
                message: other.to_string(),
            },
        }
    }
}

/// One independently sourced section of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MetricSource {
    ClusterNodes {
        nodes: Vec<ClusterNode>,
        #[serde(rename = "serverVersion", default, skip_serializing_if = "String::is_empty")]
        server_version: String,
    },
    DetectedAdapters {
        adapters: Vec<DetectedAdapter>,
    },
    TimeSeries {
        query: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        panel: String,
        #[serde(rename = "stepSecs")]
        step_secs: u64,
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_uuid: Option<String>,
    pub load_generator: LoadGeneratorKind,
    pub summary: LoadSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<MetricSource>,
}
