//! Error types for histfx

use thiserror::Error;

/// Result type alias for histfx operations
pub type Result<T> = std::result::Result<T, HistfxError>;

/// Main error type for histfx
#[derive(Error, Debug)]
pub enum HistfxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid archive URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid year-month: {0}")]
    InvalidYearMonth(String),

    /// A record was asked to move to a status its current status cannot reach.
    #[error("Illegal status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The remote answered, but not in the shape a download requires.
    #[error("Malformed response for {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl HistfxError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error describes a bad payload from the remote rather than a local failure
    pub fn is_malformed_response(&self) -> bool {
        matches!(self, Self::MalformedResponse { .. })
    }
}
