//! Routing of single events to the handler for their kind.

use super::error::ProcessorError;
use super::event::{EventIdentification, EventKind, FailureDetails, RawEvent, Recipient, Severity};
use super::result::{Counter, EventProcessingResult};
use chrono::{DateTime, Utc};

/// Applies one event to stored state.
///
/// Every handler returns the recipient the event resolved to, or `None` when
/// the email or member could not be found (deleted members, foreign emails).
/// `None` is a normal outcome, not an error.
#[rocket::async_trait]
pub trait EventProcessor: Send + Sync {
    async fn handle_delivered(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError>;

    async fn handle_opened(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError>;

    async fn handle_permanent_failed(
        &self,
        identification: EventIdentification,
        failure: FailureDetails,
    ) -> Result<Option<Recipient>, ProcessorError>;

    async fn handle_temporary_failed(
        &self,
        identification: EventIdentification,
        failure: FailureDetails,
    ) -> Result<Option<Recipient>, ProcessorError>;

    async fn handle_unsubscribed(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError>;

    async fn handle_complained(
        &self,
        identification: EventIdentification,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Recipient>, ProcessorError>;
}

/// Process one event and return its result fragment.
///
/// A resolved event bumps exactly one typed counter and contributes its email
/// and member ids; an unresolved one counts as unprocessable; an unrecognized
/// kind counts as unhandled without reaching any handler.
pub async fn process_event(
    processor: &dyn EventProcessor,
    event: &RawEvent,
) -> Result<EventProcessingResult, ProcessorError> {
    let identification = EventIdentification::from(event);

    let (recipient, counter) = match &event.kind {
        EventKind::Delivered => (
            processor
                .handle_delivered(identification, event.timestamp)
                .await?,
            Counter::Delivered,
        ),
        EventKind::Opened => (
            processor.handle_opened(identification, event.timestamp).await?,
            Counter::Opened,
        ),
        EventKind::Failed {
            severity: Severity::Permanent,
        } => (
            processor
                .handle_permanent_failed(identification, failure_details(event))
                .await?,
            Counter::PermanentFailed,
        ),
        EventKind::Failed {
            severity: Severity::Temporary,
        } => (
            processor
                .handle_temporary_failed(identification, failure_details(event))
                .await?,
            Counter::TemporaryFailed,
        ),
        EventKind::Unsubscribed => (
            processor
                .handle_unsubscribed(identification, event.timestamp)
                .await?,
            Counter::Unsubscribed,
        ),
        EventKind::Complained => (
            processor
                .handle_complained(identification, event.timestamp)
                .await?,
            Counter::Complained,
        ),
        EventKind::Unrecognized(event_type) => {
            log::debug!("unhandled event type '{}' for event {}", event_type, event.id);
            return Ok(EventProcessingResult::unhandled());
        }
    };

    Ok(match recipient {
        Some(recipient) => EventProcessingResult::resolved(recipient, counter),
        None => EventProcessingResult::unprocessable(),
    })
}

fn failure_details(event: &RawEvent) -> FailureDetails {
    FailureDetails {
        id: event.id.clone(),
        timestamp: event.timestamp,
        error: event.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubProcessor, event_at};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn permanent_failure_goes_to_permanent_handler() {
        let processor = StubProcessor::resolving();
        let event = event_at("ev-1", EventKind::Failed { severity: Severity::Permanent }, t0());

        let result = process_event(&processor, &event).await.unwrap();

        assert_eq!(result.permanent_failed, 1);
        assert_eq!(result.temporary_failed, 0);
        assert_eq!(processor.calls(), vec!["permanent_failed:ev-1".to_string()]);
    }

    #[tokio::test]
    async fn temporary_failure_goes_to_temporary_handler() {
        let processor = StubProcessor::resolving();
        let event = event_at("ev-2", EventKind::Failed { severity: Severity::Temporary }, t0());

        let result = process_event(&processor, &event).await.unwrap();

        assert_eq!(result.temporary_failed, 1);
        assert_eq!(result.permanent_failed, 0);
        assert_eq!(processor.calls(), vec!["temporary_failed:ev-2".to_string()]);
    }

    #[tokio::test]
    async fn unknown_type_is_unhandled_and_calls_nothing() {
        let processor = StubProcessor::resolving();
        let event = event_at("ev-3", EventKind::from_parts("bounced", None), t0());

        let result = process_event(&processor, &event).await.unwrap();

        assert_eq!(result.unhandled, 1);
        assert_eq!(result.total_events(), 1);
        assert!(result.email_ids().is_empty());
        assert!(processor.calls().is_empty());
    }

    #[tokio::test]
    async fn unresolved_recipient_is_unprocessable() {
        let processor = StubProcessor::unresolving();
        let event = event_at("ev-4", EventKind::Delivered, t0());

        let result = process_event(&processor, &event).await.unwrap();

        assert_eq!(result.unprocessable, 1);
        assert_eq!(result.delivered, 0);
        assert!(result.member_ids().is_empty());
    }

    #[tokio::test]
    async fn resolved_event_contributes_ids_and_one_counter() {
        let processor = StubProcessor::resolving();
        let event = event_at("ev-5", EventKind::Opened, t0());

        let result = process_event(&processor, &event).await.unwrap();

        assert_eq!(result.opened, 1);
        assert_eq!(result.total_events(), 1);
        assert_eq!(result.email_ids(), ["email-1"]);
        assert_eq!(result.member_ids(), ["member:recipient-ev-5@example.com"]);
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let processor = StubProcessor::failing();
        let event = event_at("ev-6", EventKind::Complained, t0());

        assert!(process_event(&processor, &event).await.is_err());
    }
}
