use thiserror::Error;

/// Canonical error type for benchmark setup and teardown.
///
/// Per-attempt connect/query failures never surface here; they stay inside
/// a worker's retry loop and are reported as [`crate::Event`]s. The only
/// process-fatal errors are the ones discovered before the run starts.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Invalid or missing startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error during setup or teardown.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BenchError {
    /// Creates a `Config` variant.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Convenient result alias for benchmark operations.
pub type BenchResult<T> = Result<T, BenchError>;

/// Failure surfaced by a database client capability.
///
/// `errno` is the MySQL error code when the server produced one, or a
/// synthesized code for transport-level failures (e.g. 2002 for a connect
/// timeout). `message` is the raw, un-normalized text; classification and
/// normalization happen in the aggregator.
#[derive(Debug, Clone, Error)]
#[error("errno={errno}: {message}")]
pub struct ClientError {
    pub errno: u32,
    pub message: String,
}

impl ClientError {
    #[must_use]
    pub fn new(errno: u32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}
