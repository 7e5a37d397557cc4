//! Error handling for the gateway service.

use thiserror::Error;

/// Gateway service error type
#[derive(Debug, Error)]
pub enum PipeError {
    /// Configuration-related errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket and file IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol errors
    #[error("Codec error: {0}")]
    Codec(#[from] trackwire::CodecError),

    /// Message broker errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Key-value store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Spill storage errors
    #[error("Spill error: {0}")]
    Spill(String),

    /// Payload (de)serialization errors
    #[error("Data error: {0}")]
    Data(String),
}

/// Result type alias for the gateway service
pub type Result<T> = std::result::Result<T, PipeError>;

impl PipeError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipeError::Config(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        PipeError::Broker(msg.into())
    }
}

impl From<lapin::Error> for PipeError {
    fn from(err: lapin::Error) -> Self {
        PipeError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for PipeError {
    fn from(err: serde_json::Error) -> Self {
        PipeError::Data(err.to_string())
    }
}

impl From<common::Error> for PipeError {
    fn from(err: common::Error) -> Self {
        PipeError::Store(err.to_string())
    }
}

impl From<figment::Error> for PipeError {
    fn from(err: figment::Error) -> Self {
        PipeError::Config(err.to_string())
    }
}
