//! Error types for the storage server.

use thiserror::Error;

use stratafs_core::{EngineError, Errno, SchedError};

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Error variants for the storage server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Scheduler rejected a call.
    #[error("Scheduler error: {0}")]
    Sched(#[from] SchedError),

    /// The state machine engine failed.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// TOML config could not be parsed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON config could not be parsed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config file extension is neither toml nor json.
    #[error("Unsupported config file extension: {0}")]
    UnsupportedConfigFormat(String),

    /// Config values failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation type has no state machine.
    #[error("No state machine for {0}")]
    NoMachine(String),

    /// A channel to the driver was closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl ServerError {
    /// Wire status reported to a client for this error.
    pub fn errno(&self) -> Errno {
        match self {
            ServerError::Sched(e) => e.errno(),
            ServerError::NoMachine(_) => Errno::NoSys,
            ServerError::IoError(_) | ServerError::ChannelClosed(_) => Errno::Again,
            _ => Errno::Inval,
        }
    }
}
