use super::dispatch::EventProcessor;
use super::engine::{FetchEngine, FetchWindow};
use super::error::AnalyticsError;
use super::event::EventType;
use super::job::{Cursor, JobName, JobState, ScheduleRange};
use super::provider::EventProvider;
use super::queries::AnalyticsQueries;
use super::{Clock, system_clock};
use crate::config::AnalyticsConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use schemars::JsonSchema;
use serde::Serialize;
use std::sync::Arc;

const NON_OPENED_EVENTS: [EventType; 4] = [
    EventType::Delivered,
    EventType::Failed,
    EventType::Unsubscribed,
    EventType::Complained,
];

const OPENED_EVENTS: [EventType; 1] = [EventType::Opened];

/// Snapshot of every cursor.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsStatus {
    pub latest_non_opened: JobState,
    pub latest_opened: JobState,
    pub missing: JobState,
    pub scheduled: JobState,
}

enum ScheduledPlan {
    Idle,
    Discarded,
    Fetch(FetchWindow),
}

/// Owns the four ingestion cursors and computes their windows.
pub struct EmailAnalyticsService {
    config: AnalyticsConfig,
    engine: FetchEngine,
    queries: Arc<dyn AnalyticsQueries>,
    latest_non_opened: Cursor,
    latest_opened: Cursor,
    missing: Cursor,
    scheduled: Cursor,
    clock: Clock,
}

impl EmailAnalyticsService {
    pub fn new(
        config: AnalyticsConfig,
        providers: Vec<Arc<dyn EventProvider>>,
        queries: Arc<dyn AnalyticsQueries>,
        processor: Arc<dyn EventProcessor>,
    ) -> Self {
        let clock = system_clock();
        let engine = FetchEngine::new(
            providers,
            processor,
            queries.clone(),
            config.aggregation_interval,
            config.aggregation_member_threshold,
            clock.clone(),
        );

        Self {
            config,
            engine,
            queries,
            latest_non_opened: Cursor::new(JobName::LatestNonOpened),
            latest_opened: Cursor::new(JobName::LatestOpened),
            missing: Cursor::new(JobName::Missing),
            scheduled: Cursor::new(JobName::Scheduled),
            clock,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.engine.set_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn trust_threshold(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.trust_threshold)
            .unwrap_or_else(|_| ChronoDuration::minutes(30))
    }

    fn end_margin(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.fetch_latest_end_margin)
            .unwrap_or_else(|_| ChronoDuration::minutes(1))
    }

    pub fn get_status(&self) -> AnalyticsStatus {
        AnalyticsStatus {
            latest_non_opened: self.latest_non_opened.snapshot(),
            latest_opened: self.latest_opened.snapshot(),
            missing: self.missing.snapshot(),
            scheduled: self.scheduled.snapshot(),
        }
    }

    pub async fn fetch_latest_non_opened_events(
        &self,
        max_events: Option<usize>,
    ) -> Result<usize, AnalyticsError> {
        self.fetch_latest(&self.latest_non_opened, &NON_OPENED_EVENTS, max_events)
            .await
    }

    pub async fn fetch_latest_opened_events(
        &self,
        max_events: Option<usize>,
    ) -> Result<usize, AnalyticsError> {
        self.fetch_latest(&self.latest_opened, &OPENED_EVENTS, max_events)
            .await
    }

    async fn fetch_latest(
        &self,
        cursor: &Cursor,
        event_types: &[EventType],
        max_events: Option<usize>,
    ) -> Result<usize, AnalyticsError> {
        let _claim = cursor.try_acquire()?;

        let begin = match cursor.snapshot().last_event_timestamp {
            Some(watermark) => watermark,
            None => self
                .queries
                .get_last_event_timestamp(cursor.name(), event_types)
                .await?
                .unwrap_or_else(|| self.now() - self.trust_threshold()),
        };
        let end = self.now() - self.end_margin();

        if end <= begin {
            log::info!(
                "{}: skipping fetch because end ({}) is not after begin ({})",
                cursor.name(),
                end.to_rfc3339(),
                begin.to_rfc3339()
            );
            return Ok(0);
        }

        self.engine
            .run(
                cursor,
                FetchWindow {
                    begin,
                    end,
                    max_events,
                    event_types: Some(event_types.to_vec()),
                },
            )
            .await
    }

    /// Window the backfill cursor would fetch right now.
    ///
    /// The end never enters the untrusted tail and never passes the point the
    /// latest non-opened cursor already started scanning from.
    pub fn missing_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = self.now();
        let trust = self.trust_threshold();
        let state = self.missing.snapshot();

        let begin = state
            .last_event_timestamp
            .or(state.last_begin)
            .unwrap_or_else(|| now - trust * 3);

        let trusted_end = now - trust;
        let end = match self.latest_non_opened.snapshot().last_begin {
            Some(latest_begin) => trusted_end.min(latest_begin),
            None => trusted_end,
        };

        (begin, end)
    }

    pub async fn fetch_missing(&self, max_events: Option<usize>) -> Result<usize, AnalyticsError> {
        let _claim = self.missing.try_acquire()?;
        let (begin, end) = self.missing_window();

        if end <= begin {
            log::info!(
                "{}: skipping fetch because end ({}) is not after begin ({})",
                JobName::Missing,
                end.to_rfc3339(),
                begin.to_rfc3339()
            );
            return Ok(0);
        }

        self.engine
            .run(
                &self.missing,
                FetchWindow {
                    begin,
                    end,
                    max_events,
                    event_types: None,
                },
            )
            .await
    }

    /// Replace the scheduled range. Fails while a scheduled fetch is in flight.
    pub fn schedule(&self, range: ScheduleRange) -> Result<(), AnalyticsError> {
        let _claim = self.scheduled.try_acquire()?;

        log::info!(
            "{}: scheduling fetch from {} until {}",
            JobName::Scheduled,
            range.begin.to_rfc3339(),
            range.end.to_rfc3339()
        );
        self.scheduled.replace(JobState::scheduled(range));
        Ok(())
    }

    /// Cancel the scheduled range; an in-flight fetch stops at its next page.
    pub fn cancel_scheduled(&self) {
        self.scheduled.update(|state| {
            if state.running {
                log::info!("{}: canceling in-flight fetch", JobName::Scheduled);
                state.canceled = true;
            } else if state.schedule.is_some() {
                log::info!("{}: clearing schedule", JobName::Scheduled);
                *state = JobState::new(JobName::Scheduled);
            }
        });
    }

    pub async fn fetch_scheduled(&self, max_events: Option<usize>) -> Result<usize, AnalyticsError> {
        let _claim = self.scheduled.try_acquire()?;

        let plan = self.scheduled.update(|state| {
            let Some(range) = state.schedule else {
                return ScheduledPlan::Idle;
            };

            if state.canceled {
                *state = JobState::new(JobName::Scheduled);
                return ScheduledPlan::Discarded;
            }

            let begin = match state.last_event_timestamp {
                Some(watermark) if watermark > range.begin => watermark,
                _ => range.begin,
            };

            if range.end <= begin {
                *state = JobState::new(JobName::Scheduled);
                return ScheduledPlan::Discarded;
            }

            // Marked under the same lock so a concurrent cancel sees it.
            state.running = true;
            ScheduledPlan::Fetch(FetchWindow {
                begin,
                end: range.end,
                max_events,
                event_types: None,
            })
        });

        let window = match plan {
            ScheduledPlan::Idle => return Ok(0),
            ScheduledPlan::Discarded => {
                log::info!("{}: schedule exhausted or canceled", JobName::Scheduled);
                return Ok(0);
            }
            ScheduledPlan::Fetch(window) => window,
        };

        let count = self.engine.run(&self.scheduled, window).await?;

        self.scheduled.update(|state| {
            if count == 0 || state.canceled {
                log::info!(
                    "{}: clearing schedule after {} events",
                    JobName::Scheduled,
                    count
                );
                *state = JobState::new(JobName::Scheduled);
            }
        });

        Ok(count)
    }
}
