//! Error types for the client engine.
//!
//! Per-operation push and pull failures are aggregated into the returned
//! result structs rather than raised; only configuration, validation, and
//! cancellation errors propagate out of the top-level calls.

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by the client engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Core data-model or store failure.
    #[error(transparent)]
    Core(#[from] tablesync_core::Error),

    /// Engine or pipeline configuration is unusable; fatal to the engine
    /// instance.
    #[error("configuration error: {0}")]
    Config(String),

    /// The request never produced an HTTP response (network failure,
    /// timeout, TLS error).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response arrived but violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A direct table call was rejected; the server's response is
    /// attached. Push and pull never raise this — their per-operation
    /// failures aggregate into the returned result instead.
    #[error("service call failed with HTTP {status:?}")]
    Service {
        status: Option<u16>,
        response: Box<crate::response::ServiceResponse>,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True when this error was raised by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// A validation failure in the core taxonomy: the affected call fails,
/// engine state is unchanged.
pub(crate) fn validation(message: impl Into<String>) -> ClientError {
    tablesync_core::Error::Validation(message.into()).into()
}
