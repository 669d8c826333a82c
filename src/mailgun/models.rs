use crate::analytics::{DeliveryError, EventKind, RawEvent};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Deserialize;
use serde_json::Value;

/// Body of `GET /{domain}/events`.
///
/// Items stay untyped until [`EventsResponse::into_raw_events`] so one
/// malformed item cannot fail the whole page.
#[derive(Debug, Deserialize)]
pub struct EventsResponse {
    #[serde(default)]
    pub items: Vec<Value>,
    pub paging: Option<Paging>,
}

impl EventsResponse {
    /// Normalise every usable item, skipping (and logging) the rest.
    pub fn into_raw_events(self) -> Vec<RawEvent> {
        self.items
            .into_iter()
            .filter_map(|item| {
                let id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("<no id>")
                    .to_string();
                match serde_json::from_value::<MailgunEvent>(item) {
                    Ok(event) => {
                        let raw = event.into_raw_event();
                        if raw.is_none() {
                            warn!("mailgun: skipping event {} with invalid timestamp", id);
                        }
                        raw
                    }
                    Err(e) => {
                        warn!("mailgun: skipping malformed event {}: {}", id, e);
                        None
                    }
                }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MailgunEvent {
    pub id: String,
    pub event: String,
    pub severity: Option<String>,
    #[serde(default)]
    pub recipient: String,
    /// Epoch seconds with a fractional part.
    pub timestamp: f64,
    #[serde(rename = "user-variables", default)]
    pub user_variables: Option<UserVariables>,
    pub message: Option<Message>,
    #[serde(rename = "delivery-status")]
    pub delivery_status: Option<DeliveryStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UserVariables {
    #[serde(rename = "email-id")]
    pub email_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub headers: Option<MessageHeaders>,
}

#[derive(Debug, Deserialize)]
pub struct MessageHeaders {
    #[serde(rename = "message-id")]
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeliveryStatus {
    /// Numeric SMTP code; some event types report it as a string.
    pub code: Option<Value>,
    pub message: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "enhanced-code")]
    pub enhanced_code: Option<String>,
}

impl DeliveryStatus {
    fn into_error(self) -> DeliveryError {
        let code = match self.code {
            Some(Value::Number(n)) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        let message = [self.message, self.description]
            .into_iter()
            .flatten()
            .find(|text| !text.trim().is_empty());

        DeliveryError {
            code,
            message,
            enhanced_code: self.enhanced_code.filter(|c| !c.is_empty()),
        }
    }
}

fn timestamp_from_epoch(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = seconds.trunc();
    let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

impl MailgunEvent {
    /// Normalise into the provider-neutral shape. `None` when the event has
    /// no usable timestamp.
    pub fn into_raw_event(self) -> Option<RawEvent> {
        let timestamp = timestamp_from_epoch(self.timestamp)?;
        let kind = EventKind::from_parts(&self.event, self.severity.as_deref());
        let email_id = self
            .user_variables
            .and_then(|vars| vars.email_id)
            .filter(|id| !id.is_empty());
        let provider_id = self
            .message
            .and_then(|message| message.headers)
            .and_then(|headers| headers.message_id)
            .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string())
            .filter(|id| !id.is_empty());
        let error = self.delivery_status.map(DeliveryStatus::into_error);

        Some(RawEvent {
            id: self.id,
            kind,
            recipient_email: self.recipient.to_lowercase(),
            email_id,
            provider_id,
            timestamp,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Severity;
    use chrono::TimeZone;
    use serde_json::json;

    fn parse(value: Value) -> MailgunEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn permanent_failure_is_normalised() {
        let event = parse(json!({
            "id": "abc",
            "event": "failed",
            "severity": "permanent",
            "recipient": "Member@Example.com",
            "timestamp": 1704067200.25,
            "user-variables": { "email-id": "email-42" },
            "message": { "headers": { "message-id": "<20240101.1@mg.example.com>" } },
            "delivery-status": {
                "code": 550,
                "message": "",
                "description": "mailbox unavailable",
                "enhanced-code": "5.1.1"
            }
        }))
        .into_raw_event()
        .unwrap();

        assert_eq!(event.kind, EventKind::Failed { severity: Severity::Permanent });
        assert_eq!(event.recipient_email, "member@example.com");
        assert_eq!(event.email_id.as_deref(), Some("email-42"));
        assert_eq!(event.provider_id.as_deref(), Some("20240101.1@mg.example.com"));
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::milliseconds(250)
        );

        let error = event.error.unwrap();
        assert_eq!(error.code, Some(550));
        assert_eq!(error.message.as_deref(), Some("mailbox unavailable"));
        assert_eq!(error.enhanced_code.as_deref(), Some("5.1.1"));
    }

    #[test]
    fn string_codes_and_missing_variables_are_tolerated() {
        let event = parse(json!({
            "id": "def",
            "event": "failed",
            "severity": "temporary",
            "recipient": "member@example.com",
            "timestamp": 1704067200.0,
            "delivery-status": { "code": "421", "message": "try again later" }
        }))
        .into_raw_event()
        .unwrap();

        assert_eq!(event.kind, EventKind::Failed { severity: Severity::Temporary });
        assert_eq!(event.email_id, None);
        assert_eq!(event.provider_id, None);
        assert_eq!(event.error.unwrap().code, Some(421));
    }

    #[test]
    fn unknown_event_types_survive_normalisation() {
        let event = parse(json!({
            "id": "ghi",
            "event": "stored",
            "recipient": "member@example.com",
            "timestamp": 1704067200.0
        }))
        .into_raw_event()
        .unwrap();

        assert_eq!(event.kind, EventKind::Unrecognized("stored".to_string()));
    }

    #[test]
    fn malformed_items_are_skipped_without_failing_the_page() {
        let response: EventsResponse = serde_json::from_value(json!({
            "items": [
                { "id": "no-timestamp", "event": "delivered", "recipient": "a@example.com" },
                { "id": "bad-timestamp", "event": "opened", "timestamp": "yesterday" },
                {
                    "id": "good",
                    "event": "opened",
                    "recipient": "member@example.com",
                    "timestamp": 1704067200.0
                }
            ],
            "paging": { "next": "https://api.mailgun.net/v3/mg.example.com/events/next" }
        }))
        .unwrap();

        let events = response.into_raw_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "good");
        assert_eq!(events[0].kind, EventKind::Opened);
    }

    #[test]
    fn response_without_items_parses_as_empty() {
        let response: EventsResponse = serde_json::from_value(json!({ "paging": {} })).unwrap();
        assert!(response.items.is_empty());
        assert!(response.paging.unwrap().next.is_none());
    }
}
