use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Unauthorized,
    ConfigInvalid,
    AdapterNotFound,
    AdapterUnreachable,
    StreamTerminated,
    StoreError,
    PublishError,
    LoadTestFailed,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:meshplane:error:invalid_request",
            Self::Unauthorized => "urn:meshplane:error:unauthorized",
            Self::ConfigInvalid => "urn:meshplane:error:config_invalid",
            Self::AdapterNotFound => "urn:meshplane:error:adapter_not_found",
            Self::AdapterUnreachable => "urn:meshplane:error:adapter_unreachable",
            Self::StreamTerminated => "urn:meshplane:error:stream_terminated",
            Self::StoreError => "urn:meshplane:error:store_error",
            Self::PublishError => "urn:meshplane:error:publish_error",
            Self::LoadTestFailed => "urn:meshplane:error:load_test_failed",
            Self::Timeout => "urn:meshplane:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Unauthorized => "Unauthorized",
            Self::ConfigInvalid => "Cluster Config Invalid",
            Self::AdapterNotFound => "Adapter Not Found",
            Self::AdapterUnreachable => "Adapter Unreachable",
            Self::StreamTerminated => "Stream Terminated",
            Self::StoreError => "Store Error",
            Self::PublishError => "Publish Error",
            Self::LoadTestFailed => "Load Test Failed",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthorized => 401,
            Self::ConfigInvalid => 400,
            Self::AdapterNotFound => 400,
            Self::AdapterUnreachable => 502,
            Self::StreamTerminated => 502,
            Self::StoreError => 500,
            Self::PublishError => 502,
            Self::LoadTestFailed => 502,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MeshplaneError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unauthorized")]
    Unauthorized { message: Option<String> },
    #[error("no valid kubernetes config found")]
    ConfigInvalid { message: Option<String> },
    #[error("adapter not configured: {location}")]
    AdapterNotFound { location: String },
    #[error("adapter unreachable: {location}")]
    AdapterUnreachable { location: String, message: String },
    #[error("adapter stream terminated: {location}")]
    StreamTerminated { location: String, message: String },
    /// Persistence failures carry their cause for logs only; the rendered
    /// detail stays generic.
    #[error("unable to persist session")]
    Store { message: String },
    #[error("unable to publish results")]
    Publish { status: Option<u16>, message: String },
    #[error("load test failed: {message}")]
    LoadTestFailed { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl MeshplaneError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Unauthorized { .. } => ErrorType::Unauthorized,
            Self::ConfigInvalid { .. } => ErrorType::ConfigInvalid,
            Self::AdapterNotFound { .. } => ErrorType::AdapterNotFound,
            Self::AdapterUnreachable { .. } => ErrorType::AdapterUnreachable,
            Self::StreamTerminated { .. } => ErrorType::StreamTerminated,
            Self::Store { .. } => ErrorType::StoreError,
            Self::Publish { .. } => ErrorType::PublishError,
            Self::LoadTestFailed { .. } => ErrorType::LoadTestFailed,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::InvalidRequest { .. } | Self::Store { .. } | Self::LoadTestFailed { .. } => {}
            Self::Unauthorized { message }
            | Self::ConfigInvalid { message }
            | Self::Timeout { message } => {
                if let Some(message) = message {
                    map.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::AdapterNotFound { location } => {
                map.insert("adapter".to_string(), Value::String(location.clone()));
            }
            Self::AdapterUnreachable { location, message }
            | Self::StreamTerminated { location, message } => {
                map.insert("adapter".to_string(), Value::String(location.clone()));
                map.insert("message".to_string(), Value::String(message.clone()));
            }
            Self::Publish { status, .. } => {
                if let Some(status) = status {
                    map.insert(
                        "upstreamStatus".to_string(),
                        Value::Number(serde_json::Number::from(*status)),
                    );
                }
            }
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<MeshplaneError> for ProblemDetails {
    fn from(value: MeshplaneError) -> Self {
        value.to_problem_details()
    }
}

impl From<&MeshplaneError> for ProblemDetails {
    fn from(value: &MeshplaneError) -> Self {
        value.to_problem_details()
    }
}
