use super::error::AnalyticsError;
use super::service::EmailAnalyticsService;
use schemars::JsonSchema;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Events fetched by each cursor during one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub latest_non_opened: usize,
    pub latest_opened: usize,
    pub missing: usize,
    pub scheduled: usize,
}

impl CycleReport {
    pub fn total(&self) -> usize {
        self.latest_non_opened + self.latest_opened + self.missing + self.scheduled
    }
}

/// A cursor already in flight (e.g. triggered over HTTP) counts as zero.
fn tolerate_running(result: Result<usize, AnalyticsError>) -> Result<usize, AnalyticsError> {
    match result {
        Err(AnalyticsError::AlreadyRunning(job)) => {
            log::info!("{}: still running from a previous trigger, skipping", job);
            Ok(0)
        }
        other => other,
    }
}

/// Run every cursor once, in priority order.
///
/// Non-opened events go first and are unbounded so opens never starve them.
/// The scheduled cursor gets whatever is left of the per-cycle budget after
/// the non-opened and missing cursors.
pub async fn run_cycle(service: &EmailAnalyticsService) -> Result<CycleReport, AnalyticsError> {
    let config = service.config();
    let mut report = CycleReport {
        latest_non_opened: tolerate_running(service.fetch_latest_non_opened_events(None).await)?,
        ..CycleReport::default()
    };

    report.latest_opened = tolerate_running(
        service
            .fetch_latest_opened_events(Some(config.max_opened_events))
            .await,
    )?;

    report.missing =
        tolerate_running(service.fetch_missing(Some(config.max_missing_events)).await)?;

    let remaining = config
        .max_events_per_cycle
        .saturating_sub(report.latest_non_opened)
        .saturating_sub(report.missing);
    if remaining > 0 {
        report.scheduled = tolerate_running(service.fetch_scheduled(Some(remaining)).await)?;
    } else {
        log::info!("cycle budget exhausted, skipping scheduled fetch");
    }

    Ok(report)
}

/// Background loop driving [`run_cycle`] on a fixed interval.
pub struct AnalyticsWorker {
    service: Arc<EmailAnalyticsService>,
    interval: Duration,
}

impl AnalyticsWorker {
    pub fn new(service: Arc<EmailAnalyticsService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Run cycles until `shutdown` fires. A cycle in progress is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        log::info!(
            "email analytics worker started (interval {}s)",
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match run_cycle(&self.service).await {
                Ok(report) if report.total() > 0 => {
                    log::info!(
                        "analytics cycle complete: {} non-opened, {} opened, {} missing, {} scheduled",
                        report.latest_non_opened,
                        report.latest_opened,
                        report.missing,
                        report.scheduled
                    );
                }
                Ok(_) => log::debug!("analytics cycle complete: no new events"),
                Err(e) => log::error!("analytics cycle failed: {}", e),
            }
        }

        log::info!("email analytics worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::job::ScheduleRange;
    use crate::config::AnalyticsConfig;
    use crate::test_support::{RecordingQueries, ScriptedProvider, StubProcessor, delivered_page};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn service_with(
        provider: Arc<ScriptedProvider>,
        config: AnalyticsConfig,
    ) -> EmailAnalyticsService {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        EmailAnalyticsService::new(
            config,
            vec![provider],
            Arc::new(RecordingQueries::new()),
            Arc::new(StubProcessor::resolving()),
        )
        .with_clock(Arc::new(move || now))
    }

    #[tokio::test]
    async fn cycle_runs_cursors_in_priority_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let service = service_with(provider.clone(), AnalyticsConfig::default());

        let report = run_cycle(&service).await.unwrap();

        assert_eq!(report, CycleReport::default());
        let requests = provider.requests();
        // Non-opened, opened, missing; nothing scheduled.
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].max_events, usize::MAX);
        assert_eq!(requests[1].max_events, 10_000);
        assert_eq!(requests[2].event_types, None);
    }

    #[tokio::test]
    async fn scheduled_cursor_gets_remaining_budget() {
        let t0 = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![delivered_page("a", 3, t0)]));
        let config = AnalyticsConfig {
            max_events_per_cycle: 10,
            ..AnalyticsConfig::default()
        };
        let service = service_with(provider.clone(), config);
        service
            .schedule(ScheduleRange::new(t0, t0 + ChronoDuration::hours(1)).unwrap())
            .unwrap();

        let report = run_cycle(&service).await.unwrap();

        // Every cursor sees the same three scripted events.
        assert_eq!(report.latest_non_opened, 3);
        assert_eq!(report.latest_opened, 3);
        assert_eq!(report.missing, 3);
        assert_eq!(report.scheduled, 3);
        assert_eq!(provider.requests().last().unwrap().max_events, 4);
    }

    #[tokio::test]
    async fn opened_events_do_not_count_against_scheduled_budget() {
        let t0 = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let provider = Arc::new(
            ScriptedProvider::new(vec![delivered_page("a", 5, t0)]).filtering_by_type(),
        );
        let config = AnalyticsConfig {
            max_events_per_cycle: 12,
            ..AnalyticsConfig::default()
        };
        let service = service_with(provider.clone(), config);
        service
            .schedule(ScheduleRange::new(t0, t0 + ChronoDuration::hours(1)).unwrap())
            .unwrap();

        let report = run_cycle(&service).await.unwrap();

        assert_eq!(report.latest_non_opened, 5);
        assert_eq!(report.latest_opened, 0);
        assert_eq!(report.missing, 5);
        assert_eq!(report.scheduled, 5);
        // 12 - 5 non-opened - 5 missing.
        assert_eq!(provider.requests().last().unwrap().max_events, 2);
    }

    #[tokio::test]
    async fn exhausted_budget_skips_scheduled_cursor() {
        let t0 = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![delivered_page("a", 3, t0)]));
        let config = AnalyticsConfig {
            max_events_per_cycle: 6,
            ..AnalyticsConfig::default()
        };
        let service = service_with(provider.clone(), config);
        service
            .schedule(ScheduleRange::new(t0, t0 + ChronoDuration::hours(1)).unwrap())
            .unwrap();

        let report = run_cycle(&service).await.unwrap();

        assert_eq!(report.scheduled, 0);
        assert_eq!(provider.request_count(), 3);
        assert!(service.get_status().scheduled.schedule.is_some());
    }

    #[tokio::test]
    async fn provider_failure_ends_the_cycle() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![]]).failing_at(0));
        let service = service_with(provider.clone(), AnalyticsConfig::default());

        assert!(matches!(
            run_cycle(&service).await,
            Err(AnalyticsError::Provider(_))
        ));
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let service = Arc::new(service_with(provider, AnalyticsConfig::default()));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(
            AnalyticsWorker::new(service, Duration::from_secs(3600)).run(shutdown.clone()),
        );
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker exits after shutdown")
            .unwrap();
    }
}
