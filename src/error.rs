//! Error types for harcap

use std::io;
use thiserror::Error;

/// Result type for harcap operations
pub type Result<T> = std::result::Result<T, HarError>;

/// Errors that can occur while capturing or persisting an archive
#[derive(Debug, Error)]
pub enum HarError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted archive could not be decoded
    #[error("Failed to decode archive: {0}")]
    Decode(#[from] serde_json::Error),

    /// Archive file not found
    #[error("Archive file not found: {0}")]
    FileNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A URL or query-parameter glob could not be compiled
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern as written
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Operation not valid in the session's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Stop was canceled before the archive was complete
    #[error("Operation canceled")]
    Cancelled,

    /// No instrumentation source could be attached
    #[error("No instrumentation source available: {0}")]
    NoSource(String),

    /// The instrumentation source reported a failure
    #[error("Instrumentation source error: {0}")]
    Source(String),

    /// The source has no body for the request
    #[error("Response body unavailable for request {0}")]
    BodyUnavailable(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}
