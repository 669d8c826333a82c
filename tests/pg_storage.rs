use chrono::{Duration, TimeZone, Utc};
use email_analytics::analytics::{
    AnalyticsQueries, DeliveryError, EventIdentification, EventProcessor, EventType,
    FailureDetails, JobName, JobPhase,
};
use email_analytics::storage::{PgAnalyticsQueries, PgEventProcessor};
use email_analytics::test_support::{TestDatabase, TestDatabaseError};
use sqlx::PgPool;

async fn provision(test_name: &str) -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping {test_name}: TEST_DATABASE_URL not set");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

/// One email sent in batch `batch-1` (provider id `msg-1`) to `count` members.
async fn seed(pool: &PgPool, count: usize) {
    sqlx::query("INSERT INTO emails (id, subject) VALUES ('email-1', 'Weekly digest')")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO email_batches (id, email_id, provider_id) VALUES ('batch-1', 'email-1', 'msg-1')")
        .execute(pool)
        .await
        .unwrap();

    for i in 0..count {
        let member_id = format!("member-{i}");
        let address = format!("member{i}@example.com");
        sqlx::query("INSERT INTO members (id, email) VALUES ($1, $2)")
            .bind(&member_id)
            .bind(&address)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO email_recipients (id, email_id, batch_id, member_id, member_email) VALUES ($1, 'email-1', 'batch-1', $2, $3)",
        )
        .bind(format!("recipient-{i}"))
        .bind(&member_id)
        .bind(&address)
        .execute(pool)
        .await
        .unwrap();
    }
}

fn by_email_id(address: &str) -> EventIdentification {
    EventIdentification {
        email_id: Some("email-1".to_string()),
        provider_id: None,
        email: address.to_string(),
    }
}

#[tokio::test]
async fn events_update_recipients_and_aggregates() {
    let Some(test_db) = provision("events_update_recipients_and_aggregates").await else {
        return;
    };
    let pool = test_db.pool_clone();
    seed(&pool, 2).await;

    let processor = PgEventProcessor::new(pool.clone());
    let queries = PgAnalyticsQueries::new(pool.clone());
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let delivered = processor
        .handle_delivered(by_email_id("member0@example.com"), t0)
        .await
        .unwrap()
        .expect("recipient resolved");
    assert_eq!(delivered.member_id, "member-0");

    // Resolved through the batch provider id.
    let opened = processor
        .handle_opened(
            EventIdentification {
                email_id: None,
                provider_id: Some("msg-1".to_string()),
                email: "member0@example.com".to_string(),
            },
            t0 + Duration::seconds(5),
        )
        .await
        .unwrap();
    assert!(opened.is_some());

    // A replayed delivery keeps the first timestamp.
    processor
        .handle_delivered(by_email_id("member0@example.com"), t0 + Duration::hours(1))
        .await
        .unwrap();

    let unknown = processor
        .handle_delivered(by_email_id("stranger@example.com"), t0)
        .await
        .unwrap();
    assert!(unknown.is_none());

    queries.aggregate_email_stats("email-1").await.unwrap();
    queries.aggregate_member_stats("member-0").await.unwrap();

    let (delivered_count, opened_count): (i32, i32) =
        sqlx::query_as("SELECT delivered_count, opened_count FROM emails WHERE id = 'email-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!((delivered_count, opened_count), (1, 1));

    let delivered_at: Option<chrono::DateTime<Utc>> =
        sqlx::query_scalar("SELECT delivered_at FROM email_recipients WHERE id = 'recipient-0'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(delivered_at, Some(t0));

    let (email_count, open_rate): (i32, Option<i32>) = sqlx::query_as(
        "SELECT email_count, email_open_rate FROM members WHERE id = 'member-0'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(email_count, 1);
    assert_eq!(open_rate, None, "open rate needs five tracked emails");

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn temporary_failure_never_overrides_permanent() {
    let Some(test_db) = provision("temporary_failure_never_overrides_permanent").await else {
        return;
    };
    let pool = test_db.pool_clone();
    seed(&pool, 1).await;

    let processor = PgEventProcessor::new(pool.clone());
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let failure = |id: &str, offset: i64, code: i32| FailureDetails {
        id: id.to_string(),
        timestamp: t0 + Duration::seconds(offset),
        error: Some(DeliveryError {
            code: Some(code),
            message: Some("rejected".to_string()),
            enhanced_code: None,
        }),
    };

    processor
        .handle_temporary_failed(by_email_id("member0@example.com"), failure("ev-1", 0, 421))
        .await
        .unwrap();
    processor
        .handle_permanent_failed(by_email_id("member0@example.com"), failure("ev-2", 10, 550))
        .await
        .unwrap();
    processor
        .handle_temporary_failed(by_email_id("member0@example.com"), failure("ev-3", 20, 452))
        .await
        .unwrap();

    let (severity, code, event_id): (String, Option<i32>, String) = sqlx::query_as(
        "SELECT severity, code, event_id FROM email_recipient_failures WHERE email_recipient_id = 'recipient-0'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(severity, "permanent");
    assert_eq!(code, Some(550));
    assert_eq!(event_id, "ev-2");

    let failed_at: Option<chrono::DateTime<Utc>> =
        sqlx::query_scalar("SELECT failed_at FROM email_recipients WHERE id = 'recipient-0'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failed_at, Some(t0 + Duration::seconds(10)));

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn complaints_unsubscribe_the_member() {
    let Some(test_db) = provision("complaints_unsubscribe_the_member").await else {
        return;
    };
    let pool = test_db.pool_clone();
    seed(&pool, 1).await;

    let processor = PgEventProcessor::new(pool.clone());
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    for _ in 0..2 {
        processor
            .handle_complained(by_email_id("member0@example.com"), t0)
            .await
            .unwrap();
    }

    let subscribed: bool = sqlx::query_scalar("SELECT subscribed FROM members WHERE id = 'member-0'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!subscribed);

    let events: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM email_member_events WHERE member_id = 'member-0' AND kind = 'complained'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(events, 1);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn job_watermark_prefers_stored_completion() {
    let Some(test_db) = provision("job_watermark_prefers_stored_completion").await else {
        return;
    };
    let pool = test_db.pool_clone();
    seed(&pool, 1).await;

    let processor = PgEventProcessor::new(pool.clone());
    let queries = PgAnalyticsQueries::new(pool.clone());
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    assert_eq!(
        queries
            .get_last_event_timestamp(JobName::LatestOpened, &[EventType::Opened])
            .await
            .unwrap(),
        None
    );

    processor
        .handle_opened(by_email_id("member0@example.com"), t0)
        .await
        .unwrap();
    assert_eq!(
        queries
            .get_last_event_timestamp(JobName::LatestOpened, &[EventType::Opened])
            .await
            .unwrap(),
        Some(t0)
    );

    let watermark = t0 + Duration::minutes(5);
    queries
        .set_job_timestamp(JobName::LatestOpened, JobPhase::Started, t0)
        .await
        .unwrap();
    queries
        .set_job_timestamp(JobName::LatestOpened, JobPhase::Completed, watermark)
        .await
        .unwrap();
    assert_eq!(
        queries
            .get_last_event_timestamp(JobName::LatestOpened, &[EventType::Opened])
            .await
            .unwrap(),
        Some(watermark)
    );

    test_db.close().await.expect("failed to drop test database");
}
