//! Administrative endpoints for the email analytics cursors.

use crate::analytics::{
    AnalyticsStatus, CycleReport, EmailAnalyticsService, ScheduleRange, run_cycle,
};
use crate::error::ApiError;
use chrono::{DateTime, Utc};
use rocket::{State, get, post, serde::json::Json};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Absolute range to re-fetch through the scheduled cursor.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScheduleRequest {
    /// Inclusive start, RFC 3339.
    pub begin: DateTime<Utc>,
    /// Exclusive end, RFC 3339. Must be after `begin`.
    pub end: DateTime<Utc>,
}

/// Simple message wrapper for acknowledgement responses.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Snapshot of every analytics cursor.
#[openapi(tag = "Analytics")]
#[get("/admin/analytics/status")]
pub fn get_analytics_status(
    service: &State<Arc<EmailAnalyticsService>>,
) -> Json<AnalyticsStatus> {
    Json(service.get_status())
}

/// Schedule a range for the next worker cycle. Rejected while a scheduled
/// fetch is in flight.
#[openapi(tag = "Analytics")]
#[post("/admin/analytics/schedule", data = "<request>")]
pub fn schedule_fetch(
    request: Json<ScheduleRequest>,
    service: &State<Arc<EmailAnalyticsService>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let range = ScheduleRange::new(request.begin, request.end)?;
    service.schedule(range)?;

    Ok(Json(MessageResponse {
        message: format!(
            "Scheduled fetch from {} until {}",
            range.begin.to_rfc3339(),
            range.end.to_rfc3339()
        ),
    }))
}

/// Cancel the scheduled range. An in-flight fetch stops after its current page.
#[openapi(tag = "Analytics")]
#[post("/admin/analytics/cancel")]
pub fn cancel_scheduled_fetch(
    service: &State<Arc<EmailAnalyticsService>>,
) -> Json<MessageResponse> {
    let was_running = service.get_status().scheduled.running;
    service.cancel_scheduled();

    let message = if was_running {
        "Cancellation requested for the running scheduled fetch"
    } else {
        "Scheduled fetch cleared"
    };
    Json(MessageResponse {
        message: message.to_string(),
    })
}

/// Run one worker cycle now and report per-cursor event counts.
#[openapi(tag = "Analytics")]
#[post("/admin/analytics/fetch")]
pub async fn trigger_fetch(
    service: &State<Arc<EmailAnalyticsService>>,
) -> Result<Json<CycleReport>, ApiError> {
    let report = run_cycle(service.inner()).await?;
    Ok(Json(report))
}
