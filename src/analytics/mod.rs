//! Email analytics ingestion.
//!
//! This module turns delivery events reported by email providers into
//! per-email and per-member statistics.
//!
//! # Architecture Overview
//!
//! Providers only expose a trustworthy view of an event some time after it
//! happened, so ingestion is split across four resumable cursors, each with
//! its own watermark:
//!
//! - **latest non-opened**: delivered, failed, unsubscribed and complained
//!   events up to one minute ago. Polled first so high-volume opens never
//!   starve it.
//! - **latest opened**: opened events up to one minute ago.
//! - **missing**: re-scans the window that is now older than the trust
//!   threshold but was still settling when the latest cursors passed over it.
//! - **scheduled**: an operator-requested `[begin, end)` range, consumed
//!   incrementally until exhausted or canceled.
//!
//! ## Core Components
//!
//! - **`service`**: [`EmailAnalyticsService`] owns the cursors and computes
//!   each cursor's next window.
//! - **`engine`**: [`FetchEngine`] pulls provider pages, dispatches events,
//!   flushes aggregation periodically and maintains the watermark.
//! - **`dispatch`**: routes one event to its [`EventProcessor`] handler.
//! - **`result`**: [`EventProcessingResult`] accumulates counters and the ids
//!   whose stats must be recomputed.
//! - **`job`**: [`JobState`] and the [`Cursor`] wrapper with its run lock.
//! - **`worker`**: periodic cycle running every cursor in priority order.
//!
//! ## Data Flow
//!
//! 1. The service computes a window from the cursor's watermark
//! 2. The engine pulls pages from each provider in registration order
//! 3. Each event goes through the dispatcher and its fragment is merged
//! 4. Accumulated email/member ids are flushed through the aggregation queries
//! 5. The watermark is persisted so a restart resumes where it stopped

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod provider;
pub mod queries;
pub mod result;
pub mod service;
pub mod worker;

use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use dispatch::{EventProcessor, process_event};
pub use engine::{FetchEngine, FetchWindow};
pub use error::{AnalyticsError, ProcessorError, ProviderError, QueryError};
pub use event::{
    DeliveryError, EventIdentification, EventKind, EventType, FailureDetails, RawEvent, Recipient,
    Severity,
};
pub use job::{Cursor, JobName, JobState, ScheduleRange};
pub use provider::{EventPage, EventProvider, PageRequest};
pub use queries::{AnalyticsQueries, JobPhase};
pub use result::EventProcessingResult;
pub use service::{AnalyticsStatus, EmailAnalyticsService};
pub use worker::{AnalyticsWorker, CycleReport, run_cycle};

/// Source of the current time, swappable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
