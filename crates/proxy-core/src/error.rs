use thiserror::Error;

/// Crate-wide error type. Narrower per-crate errors wrap this where useful.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend returned {status}: {body}")]
    BackendHttpError { status: u16, body: String },

    #[error("backend returned non-JSON response: {0}")]
    BackendNonJson(String),

    #[error("metadata store I/O error: {0}")]
    MetaStoreIo(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
