use super::error::QueryError;
use super::event::EventType;
use super::job::JobName;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Started,
    Completed,
}

/// Timestamp bookkeeping and stats aggregation backing the cursors.
#[rocket::async_trait]
pub trait AnalyticsQueries: Send + Sync {
    /// Last trusted watermark for a job, used when the cursor has none in memory.
    async fn get_last_event_timestamp(
        &self,
        job: JobName,
        event_types: &[EventType],
    ) -> Result<Option<DateTime<Utc>>, QueryError>;

    async fn set_job_timestamp(
        &self,
        job: JobName,
        phase: JobPhase,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueryError>;

    async fn aggregate_email_stats(&self, email_id: &str) -> Result<(), QueryError>;

    async fn aggregate_member_stats(&self, member_id: &str) -> Result<(), QueryError>;
}
