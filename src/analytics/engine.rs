//! Batched fetch, process and aggregate loop shared by every cursor.

use super::Clock;
use super::dispatch::{EventProcessor, process_event};
use super::error::{AnalyticsError, QueryError};
use super::event::{EventType, RawEvent};
use super::job::Cursor;
use super::provider::{EventProvider, PageRequest};
use super::queries::{AnalyticsQueries, JobPhase};
use super::result::EventProcessingResult;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Watermarks younger than this are never nudged forward.
const PLATEAU_MIN_AGE_SECS: i64 = 2;

/// Window handed to the engine by a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchWindow {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// `None` means unlimited.
    pub max_events: Option<usize>,
    /// `None` means every event type.
    pub event_types: Option<Vec<EventType>>,
}

enum FetchOutcome {
    Finished,
    Canceled,
}

/// Mutable bookkeeping for one engine invocation.
struct FetchRun {
    result: EventProcessingResult,
    event_count: usize,
    last_aggregation: Instant,
}

/// Clears the running flag however the fetch ends, including when the
/// future is dropped mid-flight.
struct RunningGuard<'a>(&'a Cursor);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.update(|state| state.running = false);
    }
}

pub struct FetchEngine {
    providers: Vec<Arc<dyn EventProvider>>,
    processor: Arc<dyn EventProcessor>,
    queries: Arc<dyn AnalyticsQueries>,
    aggregation_interval: Duration,
    aggregation_member_threshold: usize,
    clock: Clock,
}

impl FetchEngine {
    pub fn new(
        providers: Vec<Arc<dyn EventProvider>>,
        processor: Arc<dyn EventProcessor>,
        queries: Arc<dyn AnalyticsQueries>,
        aggregation_interval: Duration,
        aggregation_member_threshold: usize,
        clock: Clock,
    ) -> Self {
        Self {
            providers,
            processor,
            queries,
            aggregation_interval,
            aggregation_member_threshold,
            clock,
        }
    }

    pub(crate) fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    /// Fetch every provider over `window`, applying events to `cursor`.
    ///
    /// Returns the number of events seen. Cancellation is not an error: the
    /// partial count is returned and everything processed so far is aggregated.
    /// Provider and handler errors are returned after the final aggregation and
    /// after the cursor is back to idle.
    pub async fn run(&self, cursor: &Cursor, window: FetchWindow) -> Result<usize, AnalyticsError> {
        let job = cursor.name();
        let max_events = window.max_events.unwrap_or(usize::MAX);
        let started = (self.clock)();

        cursor.update(|state| {
            state.running = true;
            state.last_started = Some(started);
            state.last_begin = Some(window.begin);
        });
        let _running = RunningGuard(cursor);

        if let Err(e) = self
            .queries
            .set_job_timestamp(job, JobPhase::Started, window.begin)
            .await
        {
            log::warn!("{}: failed to persist start timestamp (non-fatal): {}", job, e);
        }

        log::info!(
            "{}: fetching events from {} until {}",
            job,
            window.begin.to_rfc3339(),
            window.end.to_rfc3339()
        );

        let mut run = FetchRun {
            result: EventProcessingResult::new(),
            event_count: 0,
            last_aggregation: Instant::now(),
        };

        let error = match self.fetch_all(cursor, &window, max_events, &mut run).await {
            Ok(FetchOutcome::Finished) => {
                log::info!("{}: fetching finished ({} events)", job, run.event_count);
                None
            }
            Ok(FetchOutcome::Canceled) => {
                log::warn!("{}: fetching canceled after {} events", job, run.event_count);
                None
            }
            Err(e) => {
                log::error!("{}: error while fetching: {}", job, e);
                Some(e)
            }
        };

        let remaining = std::mem::take(&mut run.result);
        if !remaining.is_empty() {
            if let Err(e) = self.aggregate_stats(&remaining).await {
                log::error!("{}: error while aggregating stats: {}", job, e);
            }
        }

        let now = (self.clock)();
        let exhausted = error.is_none() && run.event_count > 0 && run.event_count < max_events;
        let watermark = cursor.update(|state| {
            if exhausted {
                if let Some(last) = state.last_event_timestamp {
                    if now - last >= ChronoDuration::seconds(PLATEAU_MIN_AGE_SECS) {
                        log::info!(
                            "{}: reached end of new events, advancing watermark past {}",
                            job,
                            last.to_rfc3339()
                        );
                        state.last_event_timestamp = Some(last + ChronoDuration::seconds(1));
                    }
                }
            }
            state.last_event_timestamp
        });

        if let Some(watermark) = watermark {
            if let Err(e) = self
                .queries
                .set_job_timestamp(job, JobPhase::Completed, watermark)
                .await
            {
                log::warn!("{}: failed to persist completion timestamp (non-fatal): {}", job, e);
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(run.event_count),
        }
    }

    async fn fetch_all(
        &self,
        cursor: &Cursor,
        window: &FetchWindow,
        max_events: usize,
        run: &mut FetchRun,
    ) -> Result<FetchOutcome, AnalyticsError> {
        let request = PageRequest {
            begin: window.begin,
            end: window.end,
            max_events,
            event_types: window.event_types.clone(),
        };

        for provider in &self.providers {
            let mut provider_events = 0usize;
            let mut page_token = None;

            loop {
                let page = provider.fetch_page(&request, page_token.take()).await?;
                provider_events += page.events.len();
                log::debug!(
                    "{}: {} returned {} events",
                    cursor.name(),
                    provider.name(),
                    page.events.len()
                );

                self.process_page(cursor, &page.events, run).await?;

                if cursor.update(|state| state.canceled) {
                    return Ok(FetchOutcome::Canceled);
                }

                match page.next_page {
                    Some(token) if provider_events < max_events => page_token = Some(token),
                    _ => break,
                }
            }
        }

        Ok(FetchOutcome::Finished)
    }

    async fn process_page(
        &self,
        cursor: &Cursor,
        events: &[RawEvent],
        run: &mut FetchRun,
    ) -> Result<(), AnalyticsError> {
        for event in events {
            let fragment = process_event(self.processor.as_ref(), event).await?;
            run.result.merge(fragment);
            // Unprocessable events still advance the watermark.
            cursor.update(|state| state.observe_event(event.timestamp));
        }
        run.event_count += events.len();

        if run.last_aggregation.elapsed() > self.aggregation_interval
            || run.result.member_ids().len() > self.aggregation_member_threshold
        {
            let batch = std::mem::take(&mut run.result);
            if let Err(e) = self.aggregate_stats(&batch).await {
                log::error!("{}: error while aggregating stats: {}", cursor.name(), e);
            }
            run.last_aggregation = Instant::now();
        }

        Ok(())
    }

    /// Recompute stats for every email, then every member, in `result`.
    pub async fn aggregate_stats(&self, result: &EventProcessingResult) -> Result<(), QueryError> {
        log::info!("aggregating stats for {} emails", result.email_ids().len());
        for email_id in result.email_ids() {
            self.queries.aggregate_email_stats(email_id).await?;
        }

        let started = Instant::now();
        log::info!("aggregating stats for {} members", result.member_ids().len());
        for member_id in result.member_ids() {
            self.queries.aggregate_member_stats(member_id).await?;
        }
        log::debug!(
            "member aggregation took {:.2}ms",
            started.elapsed().as_secs_f64() * 1000.0
        );

        Ok(())
    }
}
