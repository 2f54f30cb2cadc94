//! Transfer pipeline error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations.
pub type FerryResult<T> = Result<T, FerryError>;

/// Errors that can occur while moving staged objects to the target store.
#[derive(Debug, Error)]
pub enum FerryError {
    /// Network or service hiccup. The object stays in staging for the sweeper.
    #[error("service temporarily unavailable: {0}")]
    TransientUnavailable(String),

    /// Trust relationship or policy misconfigured. Needs operator intervention.
    #[error("access denied: {0}")]
    AuthDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("verification failed for {key}: expected {expected} bytes, found {actual}")]
    VerificationMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("already running: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FerryError {
    /// Returns true if a later attempt on the same object may succeed.
    ///
    /// Transient errors leave the object in staging for the sweeper.
    pub fn is_transient(&self) -> bool {
        match self {
            FerryError::TransientUnavailable(_)
            | FerryError::VerificationMismatch { .. }
            | FerryError::Timeout(_) => true,
            FerryError::Http(e) => !e.is_status() || e.status().is_some_and(|s| s.is_server_error()),
            _ => false,
        }
    }

    /// Returns true if the error must propagate to the caller instead of
    /// being folded into a per-object outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FerryError::AuthDenied(_) | FerryError::Config(_))
    }

    /// Maps a non-success HTTP status from a storage API to an error.
    pub fn from_status(status: reqwest::StatusCode, context: impl std::fmt::Display) -> Self {
        use reqwest::StatusCode;
        match status {
            StatusCode::NOT_FOUND => FerryError::NotFound(context.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                FerryError::AuthDenied(format!("{context}: {status}"))
            }
            StatusCode::BAD_REQUEST => FerryError::InvalidArgument(format!("{context}: {status}")),
            _ => FerryError::TransientUnavailable(format!("{context}: {status}")),
        }
    }
}

impl From<figment::Error> for FerryError {
    fn from(e: figment::Error) -> Self {
        FerryError::Config(e.to_string())
    }
}
