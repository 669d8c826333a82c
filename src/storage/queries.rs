use crate::analytics::{AnalyticsQueries, EventType, JobName, JobPhase, QueryError};
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool};

/// Members need this many tracked emails before an open rate is stored.
const MIN_EMAILS_FOR_OPEN_RATE: i32 = 5;

pub struct PgAnalyticsQueries {
    pool: PgPool,
}

impl PgAnalyticsQueries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Newest recipient timestamp across the columns backing `event_types`.
    async fn latest_recipient_timestamp(
        &self,
        event_types: &[EventType],
    ) -> Result<Option<DateTime<Utc>>, QueryError> {
        let columns: Vec<&'static str> = event_types
            .iter()
            .filter_map(|event_type| match event_type {
                EventType::Delivered => Some("MAX(delivered_at)"),
                EventType::Opened => Some("MAX(opened_at)"),
                EventType::Failed => Some("MAX(failed_at)"),
                EventType::Unsubscribed | EventType::Complained => None,
            })
            .collect();

        if columns.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            "SELECT GREATEST({}) FROM email_recipients",
            columns.join(", ")
        );
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(latest)
    }
}

#[rocket::async_trait]
impl AnalyticsQueries for PgAnalyticsQueries {
    async fn get_last_event_timestamp(
        &self,
        job: JobName,
        event_types: &[EventType],
    ) -> Result<Option<DateTime<Utc>>, QueryError> {
        let finished: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT finished_at FROM email_analytics_jobs WHERE name = $1")
                .bind(job.as_str())
                .fetch_optional(&self.pool)
                .await?;

        if let Some(Some(finished_at)) = finished {
            return Ok(Some(finished_at));
        }

        let latest = self.latest_recipient_timestamp(event_types).await?;
        if let Some(latest) = latest {
            log::info!(
                "{}: no stored watermark, resuming from newest recipient event {}",
                job,
                latest.to_rfc3339()
            );
        }
        Ok(latest)
    }

    async fn set_job_timestamp(
        &self,
        job: JobName,
        phase: JobPhase,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueryError> {
        let sql = match phase {
            JobPhase::Started => {
                r#"INSERT INTO email_analytics_jobs (name, started_at, updated_at)
                   VALUES ($1, $2, NOW())
                   ON CONFLICT (name) DO UPDATE
                   SET started_at = EXCLUDED.started_at, updated_at = NOW()"#
            }
            JobPhase::Completed => {
                r#"INSERT INTO email_analytics_jobs (name, finished_at, updated_at)
                   VALUES ($1, $2, NOW())
                   ON CONFLICT (name) DO UPDATE
                   SET finished_at = EXCLUDED.finished_at, updated_at = NOW()"#
            }
        };

        sqlx::query(sql)
            .bind(job.as_str())
            .bind(timestamp)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn aggregate_email_stats(&self, email_id: &str) -> Result<(), QueryError> {
        sqlx::query(
            r#"UPDATE emails SET
                   delivered_count = stats.delivered,
                   opened_count = stats.opened,
                   failed_count = stats.failed
               FROM (
                   SELECT COUNT(delivered_at)::int AS delivered,
                          COUNT(opened_at)::int AS opened,
                          COUNT(failed_at)::int AS failed
                   FROM email_recipients
                   WHERE email_id = $1
               ) AS stats
               WHERE emails.id = $1"#,
        )
        .bind(email_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn aggregate_member_stats(&self, member_id: &str) -> Result<(), QueryError> {
        sqlx::query(
            r#"UPDATE members SET
                   email_count = stats.total,
                   email_opened_count = stats.opened,
                   email_open_rate = CASE
                       WHEN stats.total >= $2
                       THEN ROUND(stats.opened * 100.0 / stats.total)::int
                       ELSE NULL
                   END
               FROM (
                   SELECT COUNT(*)::int AS total,
                          COUNT(opened_at)::int AS opened
                   FROM email_recipients
                   WHERE member_id = $1
               ) AS stats
               WHERE members.id = $1"#,
        )
        .bind(member_id)
        .bind(MIN_EMAILS_FOR_OPEN_RATE)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
