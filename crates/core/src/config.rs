//! Configuration for a reconciliation session.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for the change-feed subscription and the reconciliation store.
///
/// Deserializes from JSON with camelCase keys; every key is optional.
///
/// ```
/// use livecall_core::SyncConfig;
///
/// let config = SyncConfig::from_json(r#"{ "debounceReloadMs": 500 }"#).unwrap();
/// assert_eq!(config.debounce_reload().as_millis(), 500);
/// assert_eq!(config.grace_period_removal().as_millis(), 5_000);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Delay before a call that left ACTIVE is removed.
    pub grace_period_removal_ms: u64,
    /// Window used to batch new-call arrivals into one reload.
    pub debounce_reload_ms: u64,
    /// A call not updated for this long is presumed abandoned.
    pub stale_threshold_ms: u64,
    /// Calls younger than this are never treated as stale.
    pub new_record_grace_ms: u64,
    /// Monitored resource (upstream table) name.
    pub resource: String,
    /// Hub name, used as the channel name prefix.
    pub hub_name: String,
    /// Lifetime of cached permission answers.
    pub scope_cache_ttl_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            grace_period_removal_ms: 5_000,
            debounce_reload_ms: 2_000,
            stale_threshold_ms: 600_000,
            new_record_grace_ms: 600_000,
            resource: "sales_calls".into(),
            hub_name: "hub".into(),
            scope_cache_ttl_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(text).map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the store cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.resource.trim().is_empty() {
            return Err(Error::invalid_config("resource must not be empty"));
        }
        if self.hub_name.trim().is_empty() {
            return Err(Error::invalid_config("hubName must not be empty"));
        }
        if self.stale_threshold_ms == 0 {
            return Err(Error::invalid_config("staleThresholdMs must be positive"));
        }
        if self.new_record_grace_ms == 0 {
            return Err(Error::invalid_config("newRecordGraceMs must be positive"));
        }
        Ok(())
    }

    #[inline]
    pub fn grace_period_removal(&self) -> Duration {
        Duration::from_millis(self.grace_period_removal_ms)
    }

    #[inline]
    pub fn debounce_reload(&self) -> Duration {
        Duration::from_millis(self.debounce_reload_ms)
    }

    #[inline]
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    #[inline]
    pub fn new_record_grace(&self) -> Duration {
        Duration::from_millis(self.new_record_grace_ms)
    }

    #[inline]
    pub fn scope_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.scope_cache_ttl_ms)
    }

    /// Builder: sets the grace period before removal.
    pub fn with_grace_period_removal(mut self, period: Duration) -> Self {
        self.grace_period_removal_ms = millis(period);
        self
    }

    /// Builder: sets the reload debounce window.
    pub fn with_debounce_reload(mut self, window: Duration) -> Self {
        self.debounce_reload_ms = millis(window);
        self
    }

    /// Builder: sets the staleness threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold_ms = millis(threshold);
        self
    }

    /// Builder: sets the new-record grace.
    pub fn with_new_record_grace(mut self, grace: Duration) -> Self {
        self.new_record_grace_ms = millis(grace);
        self
    }

    /// Builder: sets how long permission answers are cached.
    pub fn with_scope_cache_ttl(mut self, ttl: Duration) -> Self {
        self.scope_cache_ttl_ms = millis(ttl);
        self
    }

    /// Builder: sets the monitored resource.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Builder: sets the hub name.
    pub fn with_hub_name(mut self, name: impl Into<String>) -> Self {
        self.hub_name = name.into();
        self
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.grace_period_removal(), Duration::from_secs(5));
        assert_eq!(config.debounce_reload(), Duration::from_secs(2));
        assert_eq!(config.stale_threshold(), Duration::from_secs(600));
        assert_eq!(config.new_record_grace(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = SyncConfig::from_json(
            r#"{ "gracePeriodRemovalMs": 1000, "staleThresholdMs": 300000, "resource": "llamadas_ventas" }"#,
        )
        .unwrap();

        assert_eq!(config.grace_period_removal_ms, 1_000);
        assert_eq!(config.stale_threshold_ms, 300_000);
        assert_eq!(config.debounce_reload_ms, 2_000);
        assert_eq!(config.resource, "llamadas_ventas");
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(SyncConfig::from_json(r#"{ "resource": "" }"#).is_err());
        assert!(SyncConfig::from_json(r#"{ "staleThresholdMs": 0 }"#).is_err());
        assert!(SyncConfig::from_json(r#"{ "debounceReloadMs": "soon" }"#).is_err());
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::default()
            .with_grace_period_removal(Duration::from_millis(100))
            .with_debounce_reload(Duration::from_millis(50))
            .with_scope_cache_ttl(Duration::from_secs(3))
            .with_resource("calls")
            .with_hub_name("hub-ui");

        assert_eq!(config.grace_period_removal_ms, 100);
        assert_eq!(config.debounce_reload_ms, 50);
        assert_eq!(config.scope_cache_ttl(), Duration::from_secs(3));
        assert_eq!(config.resource, "calls");
        assert_eq!(config.hub_name, "hub-ui");
    }

    #[test]
    fn test_builders_saturate_huge_durations() {
        let config = SyncConfig::default().with_stale_threshold(Duration::MAX);
        assert_eq!(config.stale_threshold_ms, u64::MAX);
    }
}
