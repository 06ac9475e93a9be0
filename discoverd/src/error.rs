use thiserror::Error;

/// Errors returned by a `DiscoveryBackend`
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no instance of {name} registered at {addr}")]
    NotFound { name: String, addr: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed attributes: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
