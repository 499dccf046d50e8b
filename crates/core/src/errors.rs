//! Error types shared across the tablesync crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the core data model and codec.
#[derive(Debug, Error)]
pub enum Error {
    /// Engine or store configuration is unusable. Fatal to the engine
    /// instance that surfaced it.
    #[error("configuration error: {0}")]
    Config(String),

    /// A caller-supplied value failed validation; engine state is unchanged.
    #[error("validation error: {0}")]
    Validation(String),

    /// An entity id does not satisfy the id grammar.
    #[error("invalid entity id '{0}'")]
    InvalidEntityId(String),

    /// An OData query string or filter expression could not be parsed.
    #[error("query syntax error at offset {position}: {message}")]
    QuerySyntax { position: usize, message: String },

    /// Two queued operations for the same entity cannot be collapsed.
    #[error("operations queue integrity violation: {0}")]
    QueueIntegrity(String),

    /// A store implementation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A wire timestamp could not be parsed.
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a query syntax error at a byte offset.
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::QuerySyntax {
            position,
            message: message.into(),
        }
    }

    /// Create a storage error from any displayable failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
