//! Accumulated outcome of processing a run of events.

use super::event::Recipient;
use std::collections::HashSet;

/// Typed counter bumped by a resolved event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Delivered,
    Opened,
    PermanentFailed,
    TemporaryFailed,
    Unsubscribed,
    Complained,
}

/// Counters per event kind plus the email and member ids whose stats need
/// re-aggregation.
///
/// Ids keep first-seen order and are never duplicated, so merging results
/// that overlap yields the set union while counters sum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventProcessingResult {
    pub delivered: usize,
    pub opened: usize,
    pub permanent_failed: usize,
    pub temporary_failed: usize,
    pub unsubscribed: usize,
    pub complained: usize,
    pub unprocessable: usize,
    pub unhandled: usize,
    email_ids: Vec<String>,
    member_ids: Vec<String>,
    seen_emails: HashSet<String>,
    seen_members: HashSet<String>,
}

impl EventProcessingResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn unprocessable() -> Self {
        Self {
            unprocessable: 1,
            ..Self::default()
        }
    }

    pub(crate) fn unhandled() -> Self {
        Self {
            unhandled: 1,
            ..Self::default()
        }
    }

    /// Fragment for one successfully resolved event.
    pub(crate) fn resolved(recipient: Recipient, counter: Counter) -> Self {
        let mut result = Self::default();
        match counter {
            Counter::Delivered => result.delivered = 1,
            Counter::Opened => result.opened = 1,
            Counter::PermanentFailed => result.permanent_failed = 1,
            Counter::TemporaryFailed => result.temporary_failed = 1,
            Counter::Unsubscribed => result.unsubscribed = 1,
            Counter::Complained => result.complained = 1,
        }
        result.add_email_id(recipient.email_id);
        result.add_member_id(recipient.member_id);
        result
    }

    pub fn email_ids(&self) -> &[String] {
        &self.email_ids
    }

    pub fn member_ids(&self) -> &[String] {
        &self.member_ids
    }

    pub fn add_email_id(&mut self, email_id: String) {
        if self.seen_emails.insert(email_id.clone()) {
            self.email_ids.push(email_id);
        }
    }

    pub fn add_member_id(&mut self, member_id: String) {
        if self.seen_members.insert(member_id.clone()) {
            self.member_ids.push(member_id);
        }
    }

    /// Sum of every counter, including unprocessable and unhandled events.
    pub fn total_events(&self) -> usize {
        self.delivered
            + self.opened
            + self.permanent_failed
            + self.temporary_failed
            + self.unsubscribed
            + self.complained
            + self.unprocessable
            + self.unhandled
    }

    pub fn is_empty(&self) -> bool {
        self.total_events() == 0 && self.email_ids.is_empty() && self.member_ids.is_empty()
    }

    /// Merge another result into this one by summing counters and unioning ids.
    pub fn merge(&mut self, other: EventProcessingResult) {
        self.delivered += other.delivered;
        self.opened += other.opened;
        self.permanent_failed += other.permanent_failed;
        self.temporary_failed += other.temporary_failed;
        self.unsubscribed += other.unsubscribed;
        self.complained += other.complained;
        self.unprocessable += other.unprocessable;
        self.unhandled += other.unhandled;

        for email_id in other.email_ids {
            self.add_email_id(email_id);
        }
        for member_id in other.member_ids {
            self.add_member_id(member_id);
        }
    }
}
