use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failure talking to an explorer endpoint. Never cached at either tier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("explorer not configured: {0}")]
    UnknownExplorer(String),

    #[error("{explorer} returned HTTP {status}")]
    Status { explorer: String, status: u16 },

    #[error("{explorer} unreachable: {message}")]
    Transport { explorer: String, message: String },

    #[error("{explorer} returned an invalid body: {message}")]
    InvalidBody { explorer: String, message: String },
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
