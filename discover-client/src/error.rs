use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The registration does not exist (expired or never registered)
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other failure reported by the agent
    #[error("agent returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid update payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid agent address {0:?}")]
    InvalidAddress(String),

    /// The update stream ended before the initial sync completed
    #[error("update stream closed")]
    StreamClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
