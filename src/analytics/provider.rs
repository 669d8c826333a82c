use super::error::ProviderError;
use super::event::{EventType, RawEvent};
use chrono::{DateTime, Utc};

/// Window a cursor asks a provider for.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Providers should stop paging close to this many events.
    pub max_events: usize,
    /// `None` means every event type.
    pub event_types: Option<Vec<EventType>>,
}

/// One page of events plus the token for the page after it.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    pub next_page: Option<String>,
}

/// Source of delivery events for a `[begin, end)` window.
///
/// Paging is pulled by the caller: the first call passes `None` as the token,
/// later calls pass the `next_page` of the previous page until it is `None`.
/// Providers own their transport retries.
#[rocket::async_trait]
pub trait EventProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_page(
        &self,
        request: &PageRequest,
        page_token: Option<String>,
    ) -> Result<EventPage, ProviderError>;
}
