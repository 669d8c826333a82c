//! Resumable fetch cursors.
//!
//! Each cursor pairs a serializable [`JobState`] with a run lock. The run lock
//! is taken with `try_lock` for the whole duration of a fetch, so a second
//! invocation of the same cursor fails fast with
//! [`AnalyticsError::AlreadyRunning`] instead of racing the first one. The
//! state itself sits behind a short-lived mutex so `get_status()` can take a
//! consistent snapshot while a fetch is in flight.

use super::error::AnalyticsError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{Mutex as RunLock, MutexGuard};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobName {
    LatestNonOpened,
    LatestOpened,
    Missing,
    Scheduled,
}

impl JobName {
    /// Key under which the job's timestamps are persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::LatestNonOpened => "email-analytics-latest-others",
            JobName::LatestOpened => "email-analytics-latest-opened",
            JobName::Missing => "email-analytics-missing",
            JobName::Scheduled => "email-analytics-scheduled",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-requested absolute range for the scheduled cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ScheduleRange {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ScheduleRange {
    /// Validated constructor for ranges coming from operators.
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AnalyticsError> {
        if begin >= end {
            return Err(AnalyticsError::InvalidSchedule { begin, end });
        }
        Ok(Self { begin, end })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_name: JobName,
    pub running: bool,
    pub last_started: Option<DateTime<Utc>>,
    /// Window start of the current or last fetch.
    pub last_begin: Option<DateTime<Utc>>,
    /// Watermark the next window starts from.
    pub last_event_timestamp: Option<DateTime<Utc>>,
    pub canceled: bool,
    pub schedule: Option<ScheduleRange>,
}

impl JobState {
    pub fn new(job_name: JobName) -> Self {
        Self {
            job_name,
            running: false,
            last_started: None,
            last_begin: None,
            last_event_timestamp: None,
            canceled: false,
            schedule: None,
        }
    }

    pub fn scheduled(range: ScheduleRange) -> Self {
        Self {
            schedule: Some(range),
            ..Self::new(JobName::Scheduled)
        }
    }

    /// Raise the watermark; older timestamps are ignored.
    pub(crate) fn observe_event(&mut self, timestamp: DateTime<Utc>) {
        match self.last_event_timestamp {
            Some(current) if current >= timestamp => {}
            _ => self.last_event_timestamp = Some(timestamp),
        }
    }
}

pub struct Cursor {
    name: JobName,
    state: Mutex<JobState>,
    run_lock: RunLock<()>,
}

impl Cursor {
    pub fn new(name: JobName) -> Self {
        Self {
            name,
            state: Mutex::new(JobState::new(name)),
            run_lock: RunLock::new(()),
        }
    }

    pub fn name(&self) -> JobName {
        self.name
    }

    pub fn snapshot(&self) -> JobState {
        self.state.lock().clone()
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut JobState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(crate) fn replace(&self, state: JobState) {
        *self.state.lock() = state;
    }

    /// Claim exclusive use of this cursor until the guard drops.
    pub(crate) fn try_acquire(&self) -> Result<MutexGuard<'_, ()>, AnalyticsError> {
        self.run_lock
            .try_lock()
            .map_err(|_| AnalyticsError::AlreadyRunning(self.name))
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("name", &self.name)
            .field("state", &self.snapshot())
            .finish()
    }
}
