use rocket_db_pools::{Database, sqlx};

/// Pool backing job timestamps, event processing and stats aggregation.
#[derive(Database)]
#[database("analytics_db")]
pub struct AnalyticsDb(sqlx::PgPool);
