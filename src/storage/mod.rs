//! Postgres-backed collaborators for the analytics engine.
//!
//! - `migration`: schema setup on startup
//! - `queries`: job timestamps and stats aggregation
//! - `processor`: applies single events to recipient and member rows

pub mod migration;
pub mod processor;
pub mod queries;

pub use migration::run_migrations;
pub use processor::PgEventProcessor;
pub use queries::PgAnalyticsQueries;
