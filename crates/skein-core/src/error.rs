use chrono::{DateTime, Utc};
use thiserror::Error;

/// Core error type for skein operations.
#[derive(Error, Debug)]
pub enum SkeinError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// Raised inside an activity body.
    #[error("Activity error: {0}")]
    Activity(String),

    /// Surfaced to workflow code at the call site of a failed activity.
    #[error("Activity '{activity}' failed: {message}")]
    ActivityFailed { activity: String, message: String },

    #[error("Workflow failed: {0}")]
    WorkflowFailed(String),

    /// Workflow is waiting on a call site that is not due yet.
    ///
    /// Returned by the context and propagated with `?` up to the dispatch
    /// boundary, where it is turned into a `Suspended` workflow record.
    #[error("Workflow suspended until {wake_at}")]
    Suspended { wake_at: DateTime<Utc> },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SkeinError {
    /// Shorthand for an activity body failure.
    pub fn activity(message: impl Into<String>) -> Self {
        Self::Activity(message.into())
    }

    /// Check if this is the suspension signal.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// Errors caused by the infrastructure rather than by workflow code.
    ///
    /// A dispatch whose call sites hit one of these is abandoned without
    /// touching the workflow record, so the leased wake-up gets delivered
    /// again. Workflow code returning one on its own fails the workflow.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Io(_) | Self::LockUnavailable(_) | Self::Internal(_)
        )
    }
}

impl From<serde_json::Error> for SkeinError {
    fn from(e: serde_json::Error) -> Self {
        SkeinError::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for SkeinError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SkeinError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => SkeinError::NotFound(e.to_string()),
            _ => SkeinError::Database(e.to_string()),
        }
    }
}

/// Result type alias using SkeinError.
pub type Result<T> = std::result::Result<T, SkeinError>;
