use crate::analytics::{
    EventIdentification, EventProcessor, FailureDetails, ProcessorError, Recipient, Severity,
};
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool};

/// Recipient row an event resolved to.
struct RecipientRow {
    id: String,
    email_id: String,
    member_id: String,
}

impl From<&RecipientRow> for Recipient {
    fn from(row: &RecipientRow) -> Self {
        Recipient {
            email_id: row.email_id.clone(),
            member_id: row.member_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MemberEventKind {
    Unsubscribed,
    Complained,
}

impl MemberEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            MemberEventKind::Unsubscribed => "unsubscribed",
            MemberEventKind::Complained => "complained",
        }
    }
}

/// Applies provider events to `email_recipients` and related tables.
///
/// Every write is idempotent so re-fetching an overlapping window (the
/// missing cursor does this by design) never double counts.
pub struct PgEventProcessor {
    pool: PgPool,
}

impl PgEventProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find the recipient by email id, or by the batch's provider id when the
    /// event carries no email id.
    async fn resolve(
        &self,
        identification: &EventIdentification,
    ) -> Result<Option<RecipientRow>, ProcessorError> {
        let row: Option<(String, String, String)> = match (
            &identification.email_id,
            &identification.provider_id,
        ) {
            (Some(email_id), _) => {
                sqlx::query_as(
                    r#"SELECT id, email_id, member_id
                       FROM email_recipients
                       WHERE email_id = $1 AND member_email = $2
                       LIMIT 1"#,
                )
                .bind(email_id)
                .bind(&identification.email)
                .fetch_optional(&self.pool)
                .await?
            }
            (None, Some(provider_id)) => {
                sqlx::query_as(
                    r#"SELECT r.id, r.email_id, r.member_id
                       FROM email_recipients r
                       JOIN email_batches b ON b.id = r.batch_id
                       WHERE b.provider_id = $1 AND r.member_email = $2
                       LIMIT 1"#,
                )
                .bind(provider_id)
                .bind(&identification.email)
                .fetch_optional(&self.pool)
                .await?
            }
            (None, None) => None,
        };

        Ok(row.map(|(id, email_id, member_id)| RecipientRow {
            id,
            email_id,
            member_id,
        }))
    }

    /// Set a nullable timestamp column on the recipient if it is still unset.
    async fn mark_recipient(
        &self,
        identification: EventIdentification,
        column: &'static str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        let Some(row) = self.resolve(&identification).await? else {
            return Ok(None);
        };

        let sql = format!(
            "UPDATE email_recipients SET {column} = $1 WHERE id = $2 AND {column} IS NULL"
        );
        sqlx::query(&sql)
            .bind(timestamp)
            .bind(&row.id)
            .execute(&self.pool)
            .await?;

        Ok(Some(Recipient::from(&row)))
    }

    async fn record_failure(
        &self,
        identification: EventIdentification,
        failure: FailureDetails,
        severity: Severity,
    ) -> Result<Option<Recipient>, ProcessorError> {
        let Some(row) = self.resolve(&identification).await? else {
            return Ok(None);
        };

        let error = failure.error.unwrap_or_default();
        let mut tx = self.pool.begin().await?;

        if severity == Severity::Permanent {
            sqlx::query(
                "UPDATE email_recipients SET failed_at = $1 WHERE id = $2 AND failed_at IS NULL",
            )
            .bind(failure.timestamp)
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
        }

        // Permanent failures replace temporary ones; a temporary failure only
        // replaces an older temporary one.
        sqlx::query(
            r#"INSERT INTO email_recipient_failures
                   (email_recipient_id, email_id, member_id, event_id, severity,
                    code, message, enhanced_code, failed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (email_recipient_id) DO UPDATE SET
                   event_id = EXCLUDED.event_id,
                   severity = EXCLUDED.severity,
                   code = EXCLUDED.code,
                   message = EXCLUDED.message,
                   enhanced_code = EXCLUDED.enhanced_code,
                   failed_at = EXCLUDED.failed_at
               WHERE (EXCLUDED.severity = 'permanent'
                      AND (email_recipient_failures.severity = 'temporary'
                           OR email_recipient_failures.failed_at < EXCLUDED.failed_at))
                  OR (EXCLUDED.severity = 'temporary'
                      AND email_recipient_failures.severity = 'temporary'
                      AND email_recipient_failures.failed_at < EXCLUDED.failed_at)"#,
        )
        .bind(&row.id)
        .bind(&row.email_id)
        .bind(&row.member_id)
        .bind(&failure.id)
        .bind(severity.as_str())
        .bind(error.code)
        .bind(error.message)
        .bind(error.enhanced_code)
        .bind(failure.timestamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(Recipient::from(&row)))
    }

    /// Unsubscribe the member and remember why.
    async fn record_member_event(
        &self,
        identification: EventIdentification,
        kind: MemberEventKind,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        let Some(row) = self.resolve(&identification).await? else {
            return Ok(None);
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO email_member_events (member_id, email_id, kind, created_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (member_id, email_id, kind) DO NOTHING"#,
        )
        .bind(&row.member_id)
        .bind(&row.email_id)
        .bind(kind.as_str())
        .bind(timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE members SET subscribed = FALSE WHERE id = $1")
            .bind(&row.member_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        log::debug!(
            "member {} {} via email {}",
            row.member_id,
            kind.as_str(),
            row.email_id
        );

        Ok(Some(Recipient::from(&row)))
    }
}

#[rocket::async_trait]
impl EventProcessor for PgEventProcessor {
    async fn handle_delivered(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.mark_recipient(identification, "delivered_at", timestamp)
            .await
    }

    async fn handle_opened(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.mark_recipient(identification, "opened_at", timestamp)
            .await
    }

    async fn handle_permanent_failed(
        &self,
        identification: EventIdentification,
        failure: FailureDetails,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record_failure(identification, failure, Severity::Permanent)
            .await
    }

    async fn handle_temporary_failed(
        &self,
        identification: EventIdentification,
        failure: FailureDetails,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record_failure(identification, failure, Severity::Temporary)
            .await
    }

    async fn handle_unsubscribed(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record_member_event(identification, MemberEventKind::Unsubscribed, timestamp)
            .await
    }

    async fn handle_complained(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record_member_event(identification, MemberEventKind::Complained, timestamp)
            .await
    }
}
