#[macro_use]
extern crate rocket;

pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod mailgun;
pub mod request_logger;
pub mod routes;
pub mod storage;
#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support;

use crate::analytics::{AnalyticsWorker, EmailAnalyticsService, EventProvider};
use crate::config::{AnalyticsConfig, MailgunConfig};
use crate::db::AnalyticsDb;
use crate::mailgun::MailgunProvider;
use crate::request_logger::RequestLogger;
use crate::storage::{PgAnalyticsQueries, PgEventProcessor};
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_db_pools::sqlx::PgPool;
use rocket_okapi::{
    openapi_get_routes,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};
use tokio_util::sync::CancellationToken;

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

/// Wire the Postgres collaborators and, when configured, the Mailgun provider
/// into an analytics service.
pub fn build_analytics_service(
    pool: PgPool,
    analytics_config: AnalyticsConfig,
    mailgun_config: &MailgunConfig,
) -> EmailAnalyticsService {
    let mut providers: Vec<Arc<dyn EventProvider>> = Vec::new();
    if mailgun_config.is_configured() {
        match MailgunProvider::new(mailgun_config) {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(e) => log::error!("failed to initialise mailgun provider: {}", e),
        }
    } else {
        log::warn!("mailgun is not configured; email analytics will not fetch any events");
    }

    EmailAnalyticsService::new(
        analytics_config,
        providers,
        Arc::new(PgAnalyticsQueries::new(pool.clone())),
        Arc::new(PgEventProcessor::new(pool)),
    )
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(AnalyticsDb::init())
        .attach(cors)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match AnalyticsDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match storage::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        .attach(AdHoc::try_on_ignite(
            "Email Analytics Service",
            |rocket| async move {
                match AnalyticsDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        let analytics_config = AnalyticsConfig::from_env();
                        let mailgun_config = MailgunConfig::from_env();
                        let service = Arc::new(build_analytics_service(
                            pool,
                            analytics_config.clone(),
                            &mailgun_config,
                        ));

                        Ok(rocket
                            .manage(service)
                            .manage(analytics_config)
                            .manage(CancellationToken::new()))
                    }
                    None => {
                        log::error!("database pool not available for email analytics");
                        Err(rocket)
                    }
                }
            },
        ))
        // Spawn the analytics worker in background
        .attach(AdHoc::on_liftoff("Spawn Analytics Worker", |rocket| {
            Box::pin(async move {
                let config = rocket.state::<AnalyticsConfig>();
                let service = rocket.state::<Arc<EmailAnalyticsService>>();
                let shutdown = rocket.state::<CancellationToken>();

                match (config, service, shutdown) {
                    (Some(config), Some(service), Some(shutdown)) if config.enabled => {
                        let worker = AnalyticsWorker::new(service.clone(), config.fetch_interval);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            log::info!("starting email analytics worker");
                            worker.run(shutdown).await
                        });
                    }
                    (Some(_), Some(_), Some(_)) => {
                        log::info!("email analytics worker disabled (EMAIL_ANALYTICS_ENABLED=false)");
                    }
                    _ => log::error!("failed to spawn analytics worker: service not found"),
                }
            })
        }))
        .attach(AdHoc::on_shutdown("Stop Analytics Worker", |rocket| {
            Box::pin(async move {
                if let Some(shutdown) = rocket.state::<CancellationToken>() {
                    shutdown.cancel();
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health routes
                routes::health::health_check,
                // Analytics admin routes
                routes::analytics::get_analytics_status,
                routes::analytics::schedule_fetch,
                routes::analytics::cancel_scheduled_fetch,
                routes::analytics::trigger_fetch,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
}
