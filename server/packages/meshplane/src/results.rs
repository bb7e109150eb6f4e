//! Client for the remote results collector.

use meshplane_error::MeshplaneError;
use reqwest::header::COOKIE;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::load_test::{LoadTestResult, MetricSource};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("invalid results collector url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("results collector request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("results collector responded with status {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<CollectorError> for MeshplaneError {
    fn from(value: CollectorError) -> Self {
        let status = match &value {
            CollectorError::Status { status, .. } => Some(*status),
            _ => None,
        };
        MeshplaneError::Publish {
            status,
            message: value.to_string(),
        }
    }
}

/// Time series gathered for a published result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSubmission {
    pub result_id: String,
    pub test_uuid: String,
    pub metrics: Vec<MetricSource>,
}

#[derive(Debug, Deserialize)]
struct CreatedResult {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResultsCollector {
    http: Client,
    base: Url,
    token_name: String,
}

impl ResultsCollector {
    pub fn new(
        http: Client,
        base_url: &str,
        token_name: impl Into<String>,
    ) -> Result<Self, CollectorError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized).map_err(|err| CollectorError::InvalidUrl {
            url: base_url.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            http,
            base,
            token_name: token_name.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Publishes a load-test result. Returns the collector's id for it when
    /// the response carries one.
    pub async fn create(
        &self,
        token: Option<&str>,
        result: &LoadTestResult,
    ) -> Result<Option<String>, CollectorError> {
        let url = self.endpoint("result")?;
        let response = self
            .authorize(self.http.post(url), token)
            .json(result)
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(CollectorError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body = response.bytes().await?;
        let created = serde_json::from_slice::<CreatedResult>(&body).ok();
        Ok(created
            .and_then(|created| created.id)
            .filter(|id| !id.is_empty()))
    }

    pub async fn submit_metrics(
        &self,
        token: Option<&str>,
        submission: &MetricsSubmission,
    ) -> Result<(), CollectorError> {
        let url = self.endpoint("result/metrics")?;
        let response = self
            .authorize(self.http.put(url), token)
            .json(submission)
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(CollectorError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url, CollectorError> {
        self.base.join(path).map_err(|err| CollectorError::InvalidUrl {
            url: self.base.to_string(),
            message: err.to_string(),
        })
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match token.filter(|token| !token.is_empty()) {
            Some(token) => request.header(COOKIE, format!("{}={}", self.token_name, token)),
            None => request,
        }
    }
}
