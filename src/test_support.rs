//! Fakes and fixtures shared by unit and integration tests.

use crate::analytics::{
    AnalyticsQueries, EmailAnalyticsService, EventIdentification, EventKind, EventPage,
    EventProcessor, EventProvider, EventType, FailureDetails, JobName, JobPhase, PageRequest,
    ProcessorError, ProviderError, QueryError, RawEvent, Recipient,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rocket::config::LogLevel;
use rocket::figment::Figment;
use rocket::local::asynchronous::Client as AsyncClient;
use rocket::local::blocking::Client;
use rocket::{Build, Rocket, Route};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub use database::{TestDatabase, TestDatabaseError};

/// Event for `recipient-{id}@example.com` on `email-1`.
pub fn event_at(id: &str, kind: EventKind, timestamp: DateTime<Utc>) -> RawEvent {
    RawEvent {
        id: id.to_string(),
        kind,
        recipient_email: format!("recipient-{}@example.com", id),
        email_id: Some("email-1".to_string()),
        provider_id: Some("provider-1".to_string()),
        timestamp,
        error: None,
    }
}

/// `count` delivered events one second apart, with distinct recipients.
pub fn delivered_page(prefix: &str, count: usize, start: DateTime<Utc>) -> Vec<RawEvent> {
    (0..count)
        .map(|i| {
            event_at(
                &format!("{}-{}", prefix, i),
                EventKind::Delivered,
                start + ChronoDuration::seconds(i as i64),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StubMode {
    Resolving,
    Unresolving,
    Failing,
}

/// Event processor that records handler calls.
pub struct StubProcessor {
    mode: StubMode,
    calls: Mutex<Vec<String>>,
}

impl StubProcessor {
    /// Resolves every event to `email_id` (or `email-1`) and `member:{email}`.
    pub fn resolving() -> Self {
        Self::with_mode(StubMode::Resolving)
    }

    /// Resolves nothing, as if every member had been deleted.
    pub fn unresolving() -> Self {
        Self::with_mode(StubMode::Unresolving)
    }

    pub fn failing() -> Self {
        Self::with_mode(StubMode::Failing)
    }

    fn with_mode(mode: StubMode) -> Self {
        Self {
            mode,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(
        &self,
        call: String,
        identification: &EventIdentification,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.calls.lock().push(call);
        match self.mode {
            StubMode::Resolving => Ok(Some(Recipient {
                email_id: identification
                    .email_id
                    .clone()
                    .unwrap_or_else(|| "email-1".to_string()),
                member_id: format!("member:{}", identification.email),
            })),
            StubMode::Unresolving => Ok(None),
            StubMode::Failing => Err(ProcessorError::Other("stub failure".to_string())),
        }
    }
}

#[rocket::async_trait]
impl EventProcessor for StubProcessor {
    async fn handle_delivered(
        &self,
        identification: EventIdentification,
        _timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record(format!("delivered:{}", identification.email), &identification)
    }

    async fn handle_opened(
        &self,
        identification: EventIdentification,
        _timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record(format!("opened:{}", identification.email), &identification)
    }

    async fn handle_permanent_failed(
        &self,
        identification: EventIdentification,
        failure: FailureDetails,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record(format!("permanent_failed:{}", failure.id), &identification)
    }

    async fn handle_temporary_failed(
        &self,
        identification: EventIdentification,
        failure: FailureDetails,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record(format!("temporary_failed:{}", failure.id), &identification)
    }

    async fn handle_unsubscribed(
        &self,
        identification: EventIdentification,
        _timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record(format!("unsubscribed:{}", identification.email), &identification)
    }

    async fn handle_complained(
        &self,
        identification: EventIdentification,
        _timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError> {
        self.record(format!("complained:{}", identification.email), &identification)
    }
}

/// Blocks a [`ScriptedProvider`] once, right before it returns page `index`.
#[derive(Clone)]
pub struct PagePause {
    index: usize,
    fired: Arc<AtomicBool>,
    /// Notified when the provider reaches the page.
    pub reached: Arc<Notify>,
    /// Notify to let the provider return the page.
    pub release: Arc<Notify>,
}

fn kind_matches(kind: &EventKind, types: &[EventType]) -> bool {
    let event_type = match kind {
        EventKind::Delivered => EventType::Delivered,
        EventKind::Opened => EventType::Opened,
        EventKind::Failed { .. } => EventType::Failed,
        EventKind::Unsubscribed => EventType::Unsubscribed,
        EventKind::Complained => EventType::Complained,
        EventKind::Unrecognized(_) => return false,
    };
    types.contains(&event_type)
}

/// Provider replaying a fixed list of pages. Page tokens are page indexes.
pub struct ScriptedProvider {
    pages: Vec<Vec<RawEvent>>,
    filter_types: bool,
    failing_at: Option<usize>,
    pause: Option<PagePause>,
    requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedProvider {
    pub fn new(pages: Vec<Vec<RawEvent>>) -> Self {
        Self {
            pages,
            filter_types: false,
            failing_at: None,
            pause: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Honour `event_types` on each request like a real provider would.
    pub fn filtering_by_type(mut self) -> Self {
        self.filter_types = true;
        self
    }

    /// Fail instead of returning page `index`.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.failing_at = Some(index);
        self
    }

    pub fn pause_at(index: usize) -> PagePause {
        PagePause {
            index,
            fired: Arc::new(AtomicBool::new(false)),
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    pub fn with_pause(mut self, pause: PagePause) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Every page request received, in order.
    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[rocket::async_trait]
impl EventProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        page_token: Option<String>,
    ) -> Result<EventPage, ProviderError> {
        self.requests.lock().push(request.clone());

        let index = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|e| ProviderError::Other(format!("bad page token: {}", e)))?,
            None => 0,
        };

        if let Some(pause) = &self.pause {
            if pause.index == index && !pause.fired.swap(true, Ordering::SeqCst) {
                pause.reached.notify_one();
                pause.release.notified().await;
            }
        }

        if self.failing_at == Some(index) {
            return Err(ProviderError::Other(format!(
                "scripted failure at page {}",
                index
            )));
        }

        let mut events = self.pages.get(index).cloned().unwrap_or_default();
        if let (true, Some(types)) = (self.filter_types, &request.event_types) {
            events.retain(|event| kind_matches(&event.kind, types));
        }
        let next_page = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(EventPage { events, next_page })
    }
}

/// In-memory analytics queries recording every call.
#[derive(Default)]
pub struct RecordingQueries {
    last_event_timestamps: HashMap<JobName, DateTime<Utc>>,
    fail_aggregation: bool,
    job_timestamps: Mutex<Vec<(JobName, JobPhase, DateTime<Utc>)>>,
    aggregated_emails: Mutex<Vec<String>>,
    aggregated_members: Mutex<Vec<String>>,
}

impl RecordingQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `get_last_event_timestamp` for `job` with `timestamp`.
    pub fn with_last_event_timestamp(mut self, job: JobName, timestamp: DateTime<Utc>) -> Self {
        self.last_event_timestamps.insert(job, timestamp);
        self
    }

    pub fn failing_aggregation(mut self) -> Self {
        self.fail_aggregation = true;
        self
    }

    pub fn job_timestamps(&self) -> Vec<(JobName, JobPhase, DateTime<Utc>)> {
        self.job_timestamps.lock().clone()
    }

    pub fn aggregated_emails(&self) -> Vec<String> {
        self.aggregated_emails.lock().clone()
    }

    pub fn aggregated_members(&self) -> Vec<String> {
        self.aggregated_members.lock().clone()
    }
}

#[rocket::async_trait]
impl AnalyticsQueries for RecordingQueries {
    async fn get_last_event_timestamp(
        &self,
        job: JobName,
        _event_types: &[EventType],
    ) -> Result<Option<DateTime<Utc>>, QueryError> {
        Ok(self.last_event_timestamps.get(&job).copied())
    }

    async fn set_job_timestamp(
        &self,
        job: JobName,
        phase: JobPhase,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueryError> {
        self.job_timestamps.lock().push((job, phase, timestamp));
        Ok(())
    }

    async fn aggregate_email_stats(&self, email_id: &str) -> Result<(), QueryError> {
        if self.fail_aggregation {
            return Err(QueryError::Other("aggregation unavailable".to_string()));
        }
        self.aggregated_emails.lock().push(email_id.to_string());
        Ok(())
    }

    async fn aggregate_member_stats(&self, member_id: &str) -> Result<(), QueryError> {
        if self.fail_aggregation {
            return Err(QueryError::Other("aggregation unavailable".to_string()));
        }
        self.aggregated_members.lock().push(member_id.to_string());
        Ok(())
    }
}

pub mod database {
    use log::LevelFilter;
    use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
    use testcontainers::{ContainerAsync, runners::AsyncRunner};
    use testcontainers_modules::postgres::Postgres;
    use testcontainers_modules::testcontainers::core::error::TestcontainersError;
    use thiserror::Error;
    use tokio::runtime::Handle;
    use uuid::Uuid;

    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

    #[derive(Debug, Error)]
    pub enum TestDatabaseError {
        #[error("neither TEST_DATABASE_URL nor TEST_DATABASE_CONTAINER is set")]
        MissingUrl,
        #[error("database error: {0}")]
        Sqlx(#[from] sqlx::Error),
        #[error("migration error: {0}")]
        Migration(#[from] sqlx::migrate::MigrateError),
        #[error("container error: {0}")]
        Container(#[from] TestcontainersError),
    }

    /// Ephemeral, migrated database for integration tests.
    ///
    /// Each instance creates its own database on the server so tests can run
    /// in parallel against one Postgres.
    pub struct TestDatabase {
        pool: Option<PgPool>,
        admin_options: PgConnectOptions,
        database_name: String,
        container: Option<ContainerAsync<Postgres>>,
    }

    impl TestDatabase {
        /// Use `TEST_DATABASE_URL` when set, otherwise start a disposable
        /// Postgres container when `TEST_DATABASE_CONTAINER=1`.
        pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
            if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                return Self::with_server(&url, None).await;
            }

            let use_container = std::env::var("TEST_DATABASE_CONTAINER")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            if !use_container {
                return Err(TestDatabaseError::MissingUrl);
            }

            let container = Postgres::default().start().await?;
            let host = container.get_host().await?.to_string();
            let port = container.get_host_port_ipv4(5432).await?;
            let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            Self::with_server(&url, Some(container)).await
        }

        async fn with_server(
            url: &str,
            container: Option<ContainerAsync<Postgres>>,
        ) -> Result<Self, TestDatabaseError> {
            let base_options: PgConnectOptions = url.parse()?;
            let base_options = base_options.log_statements(LevelFilter::Off);

            let base_name = base_options
                .get_database()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "postgres".to_string());

            let admin_options = base_options.clone().database("postgres");
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options.clone())
                .await?;

            let database_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
            let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", database_name);
            sqlx::query(&create_sql).execute(&admin_pool).await?;
            admin_pool.close().await;

            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect_with(base_options.database(&database_name))
                .await?;

            MIGRATOR.run(&pool).await?;

            Ok(Self {
                pool: Some(pool),
                admin_options,
                database_name,
                container,
            })
        }

        pub fn pool(&self) -> &PgPool {
            self.pool.as_ref().expect("test database pool is available")
        }

        pub fn pool_clone(&self) -> PgPool {
            self.pool().clone()
        }

        /// Close pool connections and drop the ephemeral database.
        pub async fn close(mut self) -> Result<(), TestDatabaseError> {
            if let Some(pool) = self.pool.take() {
                pool.close().await;
            }

            drop_database(self.admin_options.clone(), &self.database_name).await?;

            if let Some(container) = self.container.take() {
                drop(container);
            }

            Ok(())
        }
    }

    async fn drop_database(
        admin_options: PgConnectOptions,
        database_name: &str,
    ) -> Result<(), sqlx::Error> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(admin_options)
            .await?;

        let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", database_name);
        sqlx::query(&drop_sql).execute(&admin_pool).await?;
        Ok(())
    }

    impl Drop for TestDatabase {
        fn drop(&mut self) {
            if let Some(pool) = self.pool.take() {
                let admin_options = self.admin_options.clone();
                let database_name = self.database_name.clone();
                if let Ok(handle) = Handle::try_current() {
                    handle.spawn(async move {
                        pool.close().await;
                        let _ = drop_database(admin_options, &database_name).await;
                    });
                }
            }

            if let Some(container) = self.container.take() {
                drop(container);
            }
        }
    }
}

/// Builder for constructing Rocket instances tailored for integration tests.
#[derive(Default)]
pub struct TestRocketBuilder {
    figment: Figment,
    mounts: Vec<(String, Vec<Route>)>,
    service: Option<Arc<EmailAnalyticsService>>,
}

impl TestRocketBuilder {
    /// Start a builder with sensible defaults: random port, logging disabled.
    pub fn new() -> Self {
        let figment = rocket::Config::figment()
            .merge(("port", 0))
            .merge(("log_level", LogLevel::Off))
            .merge(("cli_colors", false));

        Self {
            figment,
            ..Self::default()
        }
    }

    /// Mount routes under `/api/v1`.
    pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
        self.mounts.push(("/api/v1".to_string(), routes));
        self
    }

    pub fn manage_service(mut self, service: Arc<EmailAnalyticsService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn build(self) -> Rocket<Build> {
        let mut rocket = rocket::custom(self.figment);

        for (base, routes) in self.mounts {
            rocket = rocket.mount(base, routes);
        }

        if let Some(service) = self.service {
            rocket = rocket.manage(service);
        }

        rocket
    }

    pub fn blocking_client(self) -> Client {
        Client::tracked(self.build()).expect("valid Rocket instance")
    }

    pub async fn async_client(self) -> AsyncClient {
        AsyncClient::tracked(self.build())
            .await
            .expect("valid Rocket instance")
    }
}
