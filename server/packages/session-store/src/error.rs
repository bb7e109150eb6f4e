use std::path::PathBuf;

use meshplane_error::MeshplaneError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user id is empty")]
    EmptyUserId,
    #[error("session store is closed")]
    Closed,
    #[error("unable to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to open session database: {0}")]
    Open(#[source] sqlx::Error),
    #[error("unable to read session: {0}")]
    Read(#[source] sqlx::Error),
    #[error("unable to persist session: {0}")]
    Write(#[source] sqlx::Error),
    #[error("unable to decode session: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unable to encode session: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<StoreError> for MeshplaneError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::EmptyUserId => MeshplaneError::Unauthorized {
                message: Some("user id is empty".to_string()),
            },
            other => MeshplaneError::store(other.to_string()),
        }
    }
}
