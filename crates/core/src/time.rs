//! Timestamps and injectable clocks.
//!
//! Timestamps are Unix epoch milliseconds. Upstream payloads carry either
//! integer milliseconds or RFC 3339 strings, both are accepted on input.

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A point in time as Unix epoch milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from epoch milliseconds.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the epoch milliseconds.
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Parses an RFC 3339 timestamp such as `2025-12-19T10:15:00.000Z`.
    pub fn parse_rfc3339(text: &str) -> Result<Self> {
        chrono::DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|e| Error::invalid_payload(format!("bad timestamp {:?}: {}", text, e)))
    }

    /// Returns this timestamp shifted forward by `duration`.
    #[inline]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// Returns this timestamp shifted back by `duration`.
    #[inline]
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// Returns the time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let diff = self.0.saturating_sub(earlier.0);
        if diff <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(diff as u64)
        }
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Millis(i64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Millis(millis) => Ok(Timestamp(millis)),
            Repr::Text(text) => Timestamp::parse_rfc3339(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Source of the current time.
///
/// The reconciliation store reads time only through this trait so timers can
/// be exercised without wall-clock waits.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a manual clock set to `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.as_millis())),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_millis(10_000);
        assert_eq!(t.saturating_add(Duration::from_secs(5)).as_millis(), 15_000);
        assert_eq!(t.saturating_sub(Duration::from_secs(5)).as_millis(), 5_000);
        assert_eq!(
            Timestamp::from_millis(12_500).duration_since(t),
            Duration::from_millis(2_500)
        );
        assert_eq!(t.duration_since(Timestamp::from_millis(20_000)), Duration::ZERO);
    }

    #[test]
    fn test_timestamp_parse_rfc3339() {
        let t = Timestamp::parse_rfc3339("1970-01-01T00:00:01.500Z").unwrap();
        assert_eq!(t.as_millis(), 1_500);

        let t = Timestamp::parse_rfc3339("1970-01-01T01:00:00+01:00").unwrap();
        assert_eq!(t.as_millis(), 0);

        assert!(Timestamp::parse_rfc3339("yesterday").is_err());
    }

    #[test]
    fn test_timestamp_deserialize_both_forms() {
        let t: Timestamp = serde_json::from_str("42").unwrap();
        assert_eq!(t.as_millis(), 42);

        let t: Timestamp = serde_json::from_str("\"1970-01-01T00:00:02Z\"").unwrap();
        assert_eq!(t.as_millis(), 2_000);

        assert!(serde_json::from_str::<Timestamp>("\"not a date\"").is_err());
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(Timestamp::from_millis(1_500).to_string(), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        let other = clock.clone();

        clock.advance(Duration::from_millis(250));
        assert_eq!(other.now().as_millis(), 1_250);

        other.set(Timestamp::EPOCH);
        assert_eq!(clock.now(), Timestamp::EPOCH);
    }
}
