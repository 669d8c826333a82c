use super::job::JobName;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure reported by an event provider while fetching a page.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("provider error: {0}")]
    Other(String),
}

/// Failure raised by an event handler while applying an event.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event processor error: {0}")]
    Other(String),
}

/// Failure raised by timestamp bookkeeping or stats aggregation.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("query error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("invalid schedule: begin {begin} must be before end {end}")]
    InvalidSchedule {
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("{0} is already running")]
    AlreadyRunning(JobName),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Queries(#[from] QueryError),
}

impl AnalyticsError {
    /// Errors caused by the caller rather than by a collaborator.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AnalyticsError::InvalidSchedule { .. } | AnalyticsError::AlreadyRunning(_)
        )
    }
}
