//! Database migration management.
//!
//! Migrations are applied before the API starts serving requests and before
//! the backfill CLI touches any table.

use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run pending migrations.
///
/// This is idempotent: applied migrations are skipped and their checksums
/// verified, so a drifted schema aborts startup.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");

    MIGRATOR.run(pool).await?;

    log::info!("database migrations up to date");
    Ok(())
}
