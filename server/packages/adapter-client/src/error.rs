use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid adapter location `{location}`: {message}")]
    InvalidLocation { location: String, message: String },
    #[error("adapter request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("adapter responded to `{method}` with status {status}: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },
    #[error("adapter rejected `{method}` ({code}): {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("invalid adapter payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("adapter unreachable: {0}")]
    Unreachable(String),
    #[error("timed out waiting for adapter")]
    Timeout,
    #[error("adapter client is closed")]
    Closed,
}
