//! Call state classification.
//!
//! Upstream records are noisy: the status column often still says "active"
//! after the end-of-call signal (end reason, duration) has arrived. The
//! classifier derives a canonical state from all of those fields together.
//!
//! Rules, first match wins:
//!
//! 1. status ACTIVE, no end reason, no duration: `Active`.
//! 2. status ACTIVE but an end reason or a duration is present: the status is
//!    ignored and rules 3 to 6 run against the end reason and duration only.
//! 3. transfer end reason, or status TRANSFERRED: `Transferred`.
//! 4. status HUNGUP/LOST, or a failure end reason: `Failed`.
//! 5. positive duration with an unclassified reason: `Failed`.
//! 6. anything else: `Failed`.
//! 7. status COMPLETED/SUCCESSFUL overrides 3 to 6: `Completed`.
//!
//! Every non-active outcome needs feedback until `feedback_completed` is set.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::record::{CallId, RawCallRecord, RawStatus};

/// End reasons that mean the call was handed to a human agent.
const TRANSFER_REASONS: &[&str] = &["forwarded", "hook-executed-transfer"];

/// End reasons that mean the call ended without a transfer.
const FAILURE_REASONS: &[&str] = &[
    "customer-busy",
    "customer-no-answer",
    "customer-did-not-answer",
    "customer-ended",
    "assistant-ended",
];

/// Canonical lifecycle state of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalState {
    Active,
    Transferred,
    Failed,
    Completed,
}

impl CanonicalState {
    /// Returns true for `Active`.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, CanonicalState::Active)
    }
}

impl fmt::Display for CanonicalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CanonicalState::Active => "ACTIVE",
            CanonicalState::Transferred => "TRANSFERRED",
            CanonicalState::Failed => "FAILED",
            CanonicalState::Completed => "COMPLETED",
        })
    }
}

/// Result of classifying one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub state: CanonicalState,
    pub needs_feedback: bool,
}

fn reason_matches(reason: &str, family: &[&str]) -> bool {
    let reason = reason.to_ascii_lowercase();
    family.iter().any(|r| reason.contains(r))
}

/// Classifies a raw record. Pure and total: every input maps to a state.
pub fn classify(record: &RawCallRecord) -> Classification {
    let reason = record.end_reason();
    let duration = record.duration();

    if record.raw_status.is_active() && reason.is_none() && duration == 0 {
        return Classification {
            state: CanonicalState::Active,
            needs_feedback: false,
        };
    }

    // An "active" status next to end-of-call signals is stale; derive from the signals.
    let status = if record.raw_status.is_active() {
        None
    } else {
        Some(&record.raw_status)
    };

    let state = match status {
        Some(RawStatus::Completed | RawStatus::Successful) => CanonicalState::Completed,
        _ if reason.is_some_and(|r| reason_matches(r, TRANSFER_REASONS)) => {
            CanonicalState::Transferred
        }
        Some(RawStatus::Transferred) => CanonicalState::Transferred,
        Some(RawStatus::Hungup | RawStatus::Lost) => CanonicalState::Failed,
        _ if reason.is_some_and(|r| reason_matches(r, FAILURE_REASONS)) => CanonicalState::Failed,
        _ => CanonicalState::Failed,
    };

    Classification {
        state,
        needs_feedback: !record.feedback_completed,
    }
}

/// A record together with its derived classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedCall {
    pub record: RawCallRecord,
    pub state: CanonicalState,
    pub needs_feedback: bool,
}

impl ClassifiedCall {
    /// Classifies `record`.
    pub fn new(record: RawCallRecord) -> Self {
        let Classification {
            state,
            needs_feedback,
        } = classify(&record);
        Self {
            record,
            state,
            needs_feedback,
        }
    }

    /// Returns the call identity.
    #[inline]
    pub fn call_id(&self) -> &CallId {
        &self.record.call_id
    }

    /// Returns true if the call is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Returns true if the call has ended and still waits for feedback.
    #[inline]
    pub fn is_pending_feedback(&self) -> bool {
        !self.is_active() && self.needs_feedback
    }

    /// Returns true if the call belongs in historical views.
    ///
    /// Completed calls only move to history once feedback has been recorded.
    pub fn belongs_in_history(&self) -> bool {
        match self.state {
            CanonicalState::Active => false,
            CanonicalState::Completed => self.record.feedback_completed,
            CanonicalState::Transferred | CanonicalState::Failed => true,
        }
    }

    /// Re-derives the classification after the record changed.
    pub fn reclassify(&mut self) {
        let c = classify(&self.record);
        self.state = c.state;
        self.needs_feedback = c.needs_feedback;
    }
}

/// Per-state buckets for a batch of records.
#[derive(Clone, Debug, Default)]
pub struct ClassificationSummary {
    pub active: Vec<ClassifiedCall>,
    pub transferred: Vec<ClassifiedCall>,
    pub failed: Vec<ClassifiedCall>,
    pub completed: Vec<ClassifiedCall>,
    /// Records whose raw status disagrees with the derived state.
    pub reclassified: usize,
}

impl ClassificationSummary {
    /// Returns the number of classified records.
    pub fn total(&self) -> usize {
        self.active.len() + self.transferred.len() + self.failed.len() + self.completed.len()
    }
}

fn status_agrees(status: &RawStatus, state: CanonicalState) -> bool {
    matches!(
        (status, state),
        (RawStatus::Active, CanonicalState::Active)
            | (RawStatus::Transferred, CanonicalState::Transferred)
            | (RawStatus::Hungup | RawStatus::Lost, CanonicalState::Failed)
            | (
                RawStatus::Completed | RawStatus::Successful,
                CanonicalState::Completed
            )
    )
}

/// Classifies a batch and buckets it by state.
pub fn summarize<I>(records: I) -> ClassificationSummary
where
    I: IntoIterator<Item = RawCallRecord>,
{
    let mut summary = ClassificationSummary::default();
    for record in records {
        let call = ClassifiedCall::new(record);
        if !status_agrees(&call.record.raw_status, call.state) {
            summary.reclassified += 1;
        }
        match call.state {
            CanonicalState::Active => summary.active.push(call),
            CanonicalState::Transferred => summary.transferred.push(call),
            CanonicalState::Failed => summary.failed.push(call),
            CanonicalState::Completed => summary.completed.push(call),
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    fn record(status: &str) -> RawCallRecord {
        RawCallRecord::new("c-1", RawStatus::parse(status), Timestamp::EPOCH)
    }

    #[test]
    fn test_classify_plain_active() {
        let c = classify(&record("active"));
        assert_eq!(c.state, CanonicalState::Active);
        assert!(!c.needs_feedback);

        let c = classify(&record("active").with_duration(0).with_end_reason(""));
        assert_eq!(c.state, CanonicalState::Active);
    }

    #[test]
    fn test_classify_active_with_forwarded_reason() {
        let r = record("active").with_end_reason("forwarded").with_duration(340);
        let c = classify(&r);
        assert_eq!(c.state, CanonicalState::Transferred);
        assert!(c.needs_feedback);

        let c = classify(&r.with_feedback(true));
        assert_eq!(c.state, CanonicalState::Transferred);
        assert!(!c.needs_feedback);
    }

    #[test]
    fn test_classify_active_with_upstream_reason_spelling() {
        let c = classify(&record("active").with_end_reason("assistant-forwarded-call"));
        assert_eq!(c.state, CanonicalState::Transferred);

        let c = classify(&record("active").with_end_reason("Customer-Ended-Call"));
        assert_eq!(c.state, CanonicalState::Failed);
    }

    #[test]
    fn test_classify_active_with_duration_only() {
        let c = classify(&record("active").with_duration(12));
        assert_eq!(c.state, CanonicalState::Failed);
        assert!(c.needs_feedback);
    }

    #[test]
    fn test_classify_transferred_status() {
        assert_eq!(classify(&record("transferred")).state, CanonicalState::Transferred);
        assert_eq!(classify(&record("transferida")).state, CanonicalState::Transferred);
    }

    #[test]
    fn test_classify_failed_statuses_and_reasons() {
        assert_eq!(classify(&record("hungup")).state, CanonicalState::Failed);
        assert_eq!(classify(&record("lost")).state, CanonicalState::Failed);
        for reason in ["customer-busy", "customer-no-answer", "customer-ended", "assistant-ended"] {
            let c = classify(&record("").with_end_reason(reason));
            assert_eq!(c.state, CanonicalState::Failed, "reason {}", reason);
        }
    }

    #[test]
    fn test_classify_default_is_failed() {
        let c = classify(&record("queued"));
        assert_eq!(c.state, CanonicalState::Failed);
        assert!(c.needs_feedback);

        let c = classify(&record(""));
        assert_eq!(c.state, CanonicalState::Failed);
    }

    #[test]
    fn test_classify_transfer_beats_duration() {
        let c = classify(&record("lost").with_end_reason("assistant-forwarded-call").with_duration(90));
        assert_eq!(c.state, CanonicalState::Transferred);
    }

    #[test]
    fn test_classify_completed_overrides() {
        let c = classify(&record("completed").with_end_reason("forwarded").with_duration(30));
        assert_eq!(c.state, CanonicalState::Completed);
        assert!(c.needs_feedback);

        let c = classify(&record("successful").with_feedback(true));
        assert_eq!(c.state, CanonicalState::Completed);
        assert!(!c.needs_feedback);
    }

    #[test]
    fn test_classified_call_history() {
        let call = ClassifiedCall::new(record("completed"));
        assert!(!call.belongs_in_history());
        assert!(call.is_pending_feedback());

        let call = ClassifiedCall::new(record("completed").with_feedback(true));
        assert!(call.belongs_in_history());
        assert!(!call.is_pending_feedback());

        let call = ClassifiedCall::new(record("active"));
        assert!(!call.belongs_in_history());
        assert!(!call.is_pending_feedback());
    }

    #[test]
    fn test_classified_call_reclassify() {
        let mut call = ClassifiedCall::new(record("active"));
        assert!(call.is_active());

        call.record.end_reason = Some("customer-busy".into());
        call.reclassify();
        assert_eq!(call.state, CanonicalState::Failed);
    }

    #[test]
    fn test_summarize() {
        let summary = summarize(vec![
            record("active"),
            record("active").with_end_reason("forwarded"),
            record("transferred"),
            record("lost"),
            record("completed"),
        ]);

        assert_eq!(summary.total(), 5);
        assert_eq!(summary.active.len(), 1);
        assert_eq!(summary.transferred.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(summary.reclassified, 1);
    }
}
