//! Property-based tests for the call classifier using proptest.

use livecall_core::{classify, CanonicalState, RawCallRecord, RawStatus, Timestamp};
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = RawStatus> {
    prop_oneof![
        Just(RawStatus::Active),
        Just(RawStatus::Transferred),
        Just(RawStatus::Hungup),
        Just(RawStatus::Lost),
        Just(RawStatus::Completed),
        Just(RawStatus::Successful),
        Just(RawStatus::Unknown),
        "[a-z]{1,12}".prop_map(|s| RawStatus::parse(&s)),
    ]
}

fn reason_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None::<String>),
        Just(Some(String::new())),
        Just(Some("forwarded".to_string())),
        Just(Some("assistant-forwarded-call".to_string())),
        Just(Some("customer-busy".to_string())),
        Just(Some("customer-ended-call".to_string())),
        "[a-z-]{0,24}".prop_map(Some),
    ]
}

fn record_strategy() -> impl Strategy<Value = RawCallRecord> {
    (
        status_strategy(),
        reason_strategy(),
        prop::option::of(0u64..5_000),
        any::<bool>(),
        0i64..10_000_000,
    )
        .prop_map(|(status, reason, duration, feedback, created)| {
            let mut record = RawCallRecord::new("call", status, Timestamp::from_millis(created));
            record.end_reason = reason;
            record.duration_seconds = duration;
            record.feedback_completed = feedback;
            record
        })
}

proptest! {
    /// Classifying the same record twice yields the same answer.
    #[test]
    fn classify_is_deterministic(record in record_strategy()) {
        prop_assert_eq!(classify(&record), classify(&record.clone()));
    }

    /// Only a clean "active" record classifies as active.
    #[test]
    fn active_requires_clean_record(record in record_strategy()) {
        let c = classify(&record);
        if c.state == CanonicalState::Active {
            prop_assert!(record.raw_status.is_active());
            prop_assert!(record.end_reason().is_none());
            prop_assert_eq!(record.duration(), 0);
            prop_assert!(!c.needs_feedback);
        }
    }

    /// Ended calls need feedback exactly until it has been recorded.
    #[test]
    fn ended_calls_track_feedback(record in record_strategy()) {
        let c = classify(&record);
        if c.state != CanonicalState::Active {
            prop_assert_eq!(c.needs_feedback, !record.feedback_completed);
        }
    }

    /// A completed status always wins over end reasons and durations.
    #[test]
    fn completed_status_overrides(reason in reason_strategy(), duration in prop::option::of(0u64..5_000)) {
        let mut record = RawCallRecord::new("call", RawStatus::Completed, Timestamp::EPOCH);
        record.end_reason = reason;
        record.duration_seconds = duration;
        prop_assert_eq!(classify(&record).state, CanonicalState::Completed);
    }
}
