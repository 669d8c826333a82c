use email_analytics::test_support::{TestDatabase, TestDatabaseError};
use sqlx::migrate::Migrator;

static TEST_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

async fn table_exists(pool: &sqlx::PgPool, table: &str) -> bool {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .expect("lookup succeeded");
    count == 1
}

#[tokio::test]
async fn migrations_apply_and_revert_cleanly() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping migration revert test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();

    TEST_MIGRATOR.run(&pool).await.expect("migrations run");
    assert!(table_exists(&pool, "email_analytics_jobs").await);

    TEST_MIGRATOR.undo(&pool, 0).await.expect("migrations revert");
    assert!(!table_exists(&pool, "email_analytics_jobs").await);
    assert!(!table_exists(&pool, "email_recipients").await);

    TEST_MIGRATOR.run(&pool).await.expect("migrations rerun");
    assert!(table_exists(&pool, "email_recipient_failures").await);

    test_db.close().await.expect("failed to drop test database");
}
