//! Provider-agnostic delivery events.
//!
//! Providers normalise their own wire formats into [`RawEvent`] before handing
//! pages to the fetch engine. The event kind is a closed sum type so the
//! dispatcher matches exhaustively; anything a provider reports that we do not
//! model lands in [`EventKind::Unrecognized`] and is counted as unhandled.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event types a cursor can filter on when asking a provider for a window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Delivered,
    Opened,
    Failed,
    Unsubscribed,
    Complained,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Delivered,
        EventType::Opened,
        EventType::Failed,
        EventType::Unsubscribed,
        EventType::Complained,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Delivered => "delivered",
            EventType::Opened => "opened",
            EventType::Failed => "failed",
            EventType::Unsubscribed => "unsubscribed",
            EventType::Complained => "complained",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Permanent,
    Temporary,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Permanent => "permanent",
            Severity::Temporary => "temporary",
        }
    }
}

/// What happened to a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Delivered,
    Opened,
    Failed { severity: Severity },
    Unsubscribed,
    Complained,
    /// Provider reported a type we do not process (e.g. `bounced`, `clicked`).
    Unrecognized(String),
}

impl EventKind {
    /// Build a kind from a provider's type string and optional severity.
    ///
    /// Failures without an explicit `permanent` severity are temporary.
    pub fn from_parts(event_type: &str, severity: Option<&str>) -> Self {
        match event_type {
            "delivered" => EventKind::Delivered,
            "opened" => EventKind::Opened,
            "failed" => {
                let severity = match severity {
                    Some(s) if s.eq_ignore_ascii_case("permanent") => Severity::Permanent,
                    _ => Severity::Temporary,
                };
                EventKind::Failed { severity }
            }
            "unsubscribed" => EventKind::Unsubscribed,
            "complained" => EventKind::Complained,
            other => EventKind::Unrecognized(other.to_string()),
        }
    }
}

/// Delivery error details attached to failed events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryError {
    pub code: Option<i32>,
    pub message: Option<String>,
    pub enhanced_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub id: String,
    pub kind: EventKind,
    pub recipient_email: String,
    pub email_id: Option<String>,
    pub provider_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<DeliveryError>,
}

/// Identifies the recipient an event refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdentification {
    pub email_id: Option<String>,
    pub provider_id: Option<String>,
    pub email: String,
}

impl From<&RawEvent> for EventIdentification {
    fn from(event: &RawEvent) -> Self {
        Self {
            email_id: event.email_id.clone(),
            provider_id: event.provider_id.clone(),
            email: event.recipient_email.clone(),
        }
    }
}

/// Metadata passed to failure handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureDetails {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub error: Option<DeliveryError>,
}

/// A resolved email/member pair returned by the event processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email_id: String,
    pub member_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_without_permanent_severity_is_temporary() {
        assert_eq!(
            EventKind::from_parts("failed", Some("permanent")),
            EventKind::Failed { severity: Severity::Permanent }
        );
        assert_eq!(
            EventKind::from_parts("failed", Some("temporary")),
            EventKind::Failed { severity: Severity::Temporary }
        );
        assert_eq!(
            EventKind::from_parts("failed", None),
            EventKind::Failed { severity: Severity::Temporary }
        );
    }

    #[test]
    fn unknown_types_are_kept_verbatim() {
        let kind = EventKind::from_parts("bounced", None);
        assert_eq!(kind, EventKind::Unrecognized("bounced".to_string()));
    }
}
