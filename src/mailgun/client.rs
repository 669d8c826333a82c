use super::models::EventsResponse;
use crate::analytics::{EventPage, EventProvider, EventType, PageRequest, ProviderError};
use crate::config::MailgunConfig;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::time::sleep;

const MAILGUN_MAX_RETRIES: usize = 3;
const MAILGUN_RETRY_BACKOFF_MS: u64 = 500;
const MAILGUN_RETRY_BACKOFF_FACTOR: u64 = 2;

/// Pulls delivery events from the Mailgun events API.
///
/// The first page is built from the request window; later pages follow the
/// absolute `paging.next` URL Mailgun returns.
#[derive(Debug, Clone)]
pub struct MailgunProvider {
    http: Client,
    events_url: String,
    api_key: String,
    page_size: usize,
    tag: Option<String>,
}

impl MailgunProvider {
    pub fn new(config: &MailgunConfig) -> Result<Self, ProviderError> {
        let (Some(api_key), Some(domain)) = (&config.api_key, &config.domain) else {
            return Err(ProviderError::Other(
                "MAILGUN_API_KEY and MAILGUN_DOMAIN must be set".to_string(),
            ));
        };

        let http = Client::builder()
            .timeout(config.request_timeout)
            .gzip(true)
            .build()?;

        Ok(Self {
            http,
            events_url: format!("{}/{}/events", config.base_url.trim_end_matches('/'), domain),
            api_key: api_key.clone(),
            page_size: config.page_size,
            tag: config.tag.clone(),
        })
    }

    fn first_page_query(&self, request: &PageRequest) -> Vec<(&'static str, String)> {
        let event_types = request
            .event_types
            .as_deref()
            .unwrap_or(&EventType::ALL)
            .iter()
            .map(EventType::as_str)
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut query = vec![
            ("begin", request.begin.timestamp().to_string()),
            ("end", request.end.timestamp().to_string()),
            ("ascending", "yes".to_string()),
            (
                "limit",
                self.page_size.min(request.max_events.max(1)).to_string(),
            ),
            ("event", event_types),
        ];
        if let Some(tag) = &self.tag {
            query.push(("tags", tag.clone()));
        }
        query
    }

    async fn get_with_retries(
        &self,
        request: &PageRequest,
        page_url: Option<&str>,
    ) -> Result<EventsResponse, ProviderError> {
        let mut backoff_ms = MAILGUN_RETRY_BACKOFF_MS;
        for attempt in 1..=MAILGUN_MAX_RETRIES {
            match self.get_once(request, page_url).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < MAILGUN_MAX_RETRIES && is_retryable(&err) => {
                    warn!("mailgun: request attempt {} failed: {}", attempt, err);
                }
                Err(err) => return Err(err),
            }

            let delay = Duration::from_millis(backoff_ms);
            debug!(
                "mailgun: retrying after {:?} backoff (attempt {} of {})",
                delay,
                attempt + 1,
                MAILGUN_MAX_RETRIES
            );
            sleep(delay).await;
            backoff_ms = backoff_ms.saturating_mul(MAILGUN_RETRY_BACKOFF_FACTOR);
        }

        Err(ProviderError::Other(
            "mailgun: retries exhausted".to_string(),
        ))
    }

    async fn get_once(
        &self,
        request: &PageRequest,
        page_url: Option<&str>,
    ) -> Result<EventsResponse, ProviderError> {
        let builder = match page_url {
            Some(url) => self.http.get(url),
            None => self
                .http
                .get(&self.events_url)
                .query(&self.first_page_query(request)),
        };

        let response = builder
            .basic_auth("api", Some(&self.api_key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn is_retryable(err: &ProviderError) -> bool {
    match err {
        ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
        ProviderError::Status { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
        }
        ProviderError::Decode(_) | ProviderError::Other(_) => false,
    }
}

#[rocket::async_trait]
impl EventProvider for MailgunProvider {
    fn name(&self) -> &str {
        "mailgun"
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        page_token: Option<String>,
    ) -> Result<EventPage, ProviderError> {
        let response = self
            .get_with_retries(request, page_token.as_deref())
            .await?;

        // Mailgun always returns a next URL; an empty page is the real end.
        if response.items.is_empty() {
            return Ok(EventPage::default());
        }

        let total = response.items.len();
        let next_page = response.paging.as_ref().and_then(|paging| paging.next.clone());
        let events = response.into_raw_events();
        debug!("mailgun: page with {} items ({} usable)", total, events.len());

        Ok(EventPage {
            events,
            next_page,
        })
    }
}
