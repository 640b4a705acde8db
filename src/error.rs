//! Error taxonomy for the synchronization pipeline
//!
//! Every fallible step of a stage (external fetch, store write, tracker call)
//! reports a [`SyncError`]. The variants encode how the pipeline reacts:
//! transient failures are retried, rate limits are retried on a steeper curve,
//! foreign-key violations trigger dependency repair and cancellation unwinds
//! the stage without marking it failed.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the sync core
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Stage '{0}' already has a running execution")]
    AlreadyRunning(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage '{stage}' aborted after {count} consecutive page errors: {last_error}")]
    TooManyErrors {
        stage: String,
        count: u32,
        last_error: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SyncError {
    /// Throttling responses get the steeper backoff curve
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether another attempt of the same call can possibly succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::Http { .. }
            | Self::RateLimited { .. }
            | Self::Database(_) => true,
            Self::NotFound(_)
            | Self::Decode(_)
            | Self::ForeignKeyViolation(_)
            | Self::Cancelled
            | Self::AlreadyRunning(_)
            | Self::UnknownStage(_)
            | Self::TooManyErrors { .. }
            | Self::Configuration(_) => false,
        }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Server-provided `Retry-After`, if any
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_foreign_key_violation()
                || db_err.message().contains("FOREIGN KEY constraint failed")
            {
                return Self::ForeignKeyViolation(db_err.message().to_string());
            }
        }
        Self::Database(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
