//! Error types for the murmur pipeline.

use thiserror::Error;

use crate::models::FailureCode;

/// Result type alias using murmur's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for murmur operations.
///
/// Adapter-facing variants follow the pipeline taxonomy: transient errors
/// are eligible for retry with backoff, permanent errors short-circuit the
/// job to `FAILED` with a stable reason code.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Note not found
    #[error("Note not found: {0}")]
    NoteNotFound(uuid::Uuid),

    /// Processing job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Adapter failed transiently (network, rate-limit, 5xx) — retryable
    #[error("Transient adapter error: {0}")]
    TransientAdapter(String),

    /// Adapter rejected the input permanently — fail fast, no retry
    #[error("Permanent adapter error ({code}): {message}")]
    PermanentAdapter {
        code: FailureCode,
        message: String,
    },

    /// Reservation would exceed the user's available balance
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    /// Duplicate submission or conflicting state transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Optimistic version check failed — caller should re-read and retry
    #[error("Stale version for job {0}")]
    StaleVersion(uuid::Uuid),

    /// Vector/text index write failed — retryable, job stays in EMBEDDING
    #[error("Index write error: {0}")]
    IndexWrite(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is eligible for retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientAdapter(_) | Error::IndexWrite(_) | Error::Request(_)
        )
    }

    /// The failure reason code this error maps to when it terminates a job.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Error::PermanentAdapter { code, .. } => *code,
            Error::InsufficientBalance { .. } => FailureCode::BillingRejected,
            _ => FailureCode::AdapterError,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
