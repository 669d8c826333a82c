use std::io::{self, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use email_analytics::analytics::{EmailAnalyticsService, ScheduleRange};
use email_analytics::config::{AnalyticsConfig, MailgunConfig};
use email_analytics::{build_analytics_service, storage};

#[derive(Parser, Debug)]
#[command(
    name = "backfill",
    about = "Re-fetch email analytics events for an absolute time range"
)]
struct Args {
    /// Start of the range (RFC 3339, e.g. 2024-01-01T00:00:00Z).
    #[arg(long)]
    begin: DateTime<Utc>,

    /// End of the range (RFC 3339), exclusive.
    #[arg(long)]
    end: DateTime<Utc>,

    /// Events fetched per batch before progress is reported.
    #[arg(long, default_value_t = 10_000)]
    max_events: usize,
}

async fn run_backfill(
    service: Arc<EmailAnalyticsService>,
    max_events: usize,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut total = 0;
    loop {
        let fetched = service.fetch_scheduled(Some(max_events)).await?;
        if fetched == 0 {
            return Ok(total);
        }
        total += fetched;

        let watermark = service
            .get_status()
            .scheduled
            .last_event_timestamp
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("fetched {fetched} events ({total} total), up to {watermark}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let range = match ScheduleRange::new(args.begin, args.end) {
        Ok(range) => range,
        Err(err) => {
            writeln!(io::stderr(), "error: {err}")?;
            std::process::exit(1);
        }
    };

    let mailgun_config = MailgunConfig::from_env();
    if !mailgun_config.is_configured() {
        writeln!(
            io::stderr(),
            "error: MAILGUN_API_KEY and MAILGUN_DOMAIN must be set"
        )?;
        std::process::exit(1);
    }

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    storage::run_migrations(&pool).await?;

    let service = Arc::new(build_analytics_service(
        pool,
        AnalyticsConfig::from_env(),
        &mailgun_config,
    ));
    service.schedule(range)?;

    let total = run_backfill(service, args.max_events.max(1)).await?;
    println!(
        "Backfill from {} until {} complete: {total} events",
        range.begin.to_rfc3339(),
        range.end.to_rfc3339()
    );
    Ok(())
}
