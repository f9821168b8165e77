//! Keyed deadline queue for grace-period removals and the reload debounce.
//!
//! Timers are plain data: nothing fires on its own. The owner asks for the
//! keys that are due at a given time, which keeps every timer observable and
//! testable under a manual clock.

use hashbrown::HashMap;
use livecall_core::{CallId, Timestamp};
use std::collections::BTreeSet;

/// Identity of a scheduled task.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Grace-period removal of one call.
    Removal(CallId),
    /// The single debounced full reload.
    Reload,
}

/// Deadlines keyed by [`TimerKey`], at most one per key.
#[derive(Debug, Default)]
pub struct TimerQueue {
    deadlines: HashMap<TimerKey, Timestamp>,
    ordered: BTreeSet<(Timestamp, TimerKey)>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `key` at `at`, replacing any earlier deadline for it.
    ///
    /// Returns the replaced deadline.
    pub fn schedule(&mut self, key: TimerKey, at: Timestamp) -> Option<Timestamp> {
        let previous = self.deadlines.insert(key.clone(), at);
        if let Some(prev) = previous {
            self.ordered.remove(&(prev, key.clone()));
        }
        self.ordered.insert((at, key));
        previous
    }

    /// Schedules `key` only if it is not already scheduled.
    ///
    /// Returns true if a new deadline was set.
    pub fn schedule_if_absent(&mut self, key: TimerKey, at: Timestamp) -> bool {
        if self.deadlines.contains_key(&key) {
            return false;
        }
        self.schedule(key, at);
        true
    }

    /// Cancels `key`. Returns true if it was scheduled.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.deadlines.remove(key) {
            Some(at) => {
                self.ordered.remove(&(at, key.clone()));
                true
            }
            None => false,
        }
    }

    /// Returns the deadline of `key`.
    #[inline]
    pub fn deadline(&self, key: &TimerKey) -> Option<Timestamp> {
        self.deadlines.get(key).copied()
    }

    #[inline]
    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Removes and returns every key due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<TimerKey> {
        let mut due = Vec::new();
        while let Some((at, _)) = self.ordered.first() {
            if *at > now {
                break;
            }
            if let Some((_, key)) = self.ordered.pop_first() {
                self.deadlines.remove(&key);
                due.push(key);
            }
        }
        due
    }

    /// Returns the earliest deadline.
    #[inline]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.ordered.first().map(|(at, _)| *at)
    }

    /// Returns the number of scheduled grace-period removals.
    pub fn removal_count(&self) -> usize {
        self.deadlines
            .keys()
            .filter(|k| matches!(k, TimerKey::Removal(_)))
            .count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Cancels everything.
    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.ordered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removal(id: &str) -> TimerKey {
        TimerKey::Removal(CallId::new(id))
    }

    fn at(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn test_schedule_and_pop_due_in_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(removal("b"), at(200));
        timers.schedule(TimerKey::Reload, at(150));
        timers.schedule(removal("a"), at(100));

        assert_eq!(timers.next_deadline(), Some(at(100)));
        assert_eq!(timers.pop_due(at(160)), vec![removal("a"), TimerKey::Reload]);
        assert_eq!(timers.len(), 1);
        assert!(timers.pop_due(at(199)).is_empty());
        assert_eq!(timers.pop_due(at(200)), vec![removal("b")]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_schedule_replaces_deadline() {
        let mut timers = TimerQueue::new();
        assert_eq!(timers.schedule(TimerKey::Reload, at(100)), None);
        assert_eq!(timers.schedule(TimerKey::Reload, at(300)), Some(at(100)));

        assert!(timers.pop_due(at(100)).is_empty());
        assert_eq!(timers.deadline(&TimerKey::Reload), Some(at(300)));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_schedule_if_absent_keeps_deadline() {
        let mut timers = TimerQueue::new();
        assert!(timers.schedule_if_absent(removal("a"), at(100)));
        assert!(!timers.schedule_if_absent(removal("a"), at(500)));
        assert_eq!(timers.deadline(&removal("a")), Some(at(100)));
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerQueue::new();
        timers.schedule(removal("a"), at(100));
        timers.schedule(TimerKey::Reload, at(100));

        assert!(timers.cancel(&removal("a")));
        assert!(!timers.cancel(&removal("a")));
        assert_eq!(timers.removal_count(), 0);
        assert_eq!(timers.pop_due(at(1_000)), vec![TimerKey::Reload]);
    }

    #[test]
    fn test_clear() {
        let mut timers = TimerQueue::new();
        timers.schedule(removal("a"), at(1));
        timers.schedule(removal("b"), at(2));
        timers.clear();
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
