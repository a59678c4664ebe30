//! Error types for a3s-insight

use thiserror::Error;

/// Errors that can occur while protecting, analyzing, or persisting a session
#[derive(Debug, Error)]
pub enum InsightError {
    /// A model backend failed with an error that is not an availability problem
    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// Every configured backend was rate-limited or unavailable
    #[error("All {attempted} backends failed. Last error: {last_error}")]
    BackendsExhausted { attempted: usize, last_error: String },

    /// No backends configured
    #[error("No model backends configured")]
    NoBackends,

    /// Generated code failed while running (after any self-heal attempt)
    #[error("Execution error: {0}")]
    Execution(String),

    /// Session store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Session identifier rejected (empty or unsafe characters)
    #[error("Invalid session id: {0}")]
    InvalidSession(String),

    /// Session not found in the cache or the durable store
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Upload has a file extension no loader handles
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Upload has a supported extension but its bytes could not be parsed
    #[error("Failed to parse '{filename}': {reason}")]
    Parse { filename: String, reason: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record sealing or unsealing failure
    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// Result type alias for insight operations
pub type Result<T> = std::result::Result<T, InsightError>;
