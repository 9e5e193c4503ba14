//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default age after which successful data may be refreshed in the background.
pub const DEFAULT_STALE_TIME: Duration = Duration::ZERO;

/// Default delay between the last unsubscribe and entry deletion.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Default window after a first successful load during which background
/// refetches are suppressed.
pub const DEFAULT_FIRST_FETCH_GRACE: Duration = Duration::from_secs(2);

/// Configuration for a [`QueryCache`](crate::QueryCache).
///
/// Durations are read from and written as whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which successful data is eligible for background refresh.
    #[serde(rename = "stale_time_ms", with = "duration_ms")]
    pub stale_time: Duration,
    /// Delay after the last unsubscribe before an entry is deleted.
    #[serde(rename = "gc_time_ms", with = "duration_ms")]
    pub gc_time: Duration,
    /// Window after a first success during which background refetch is
    /// suppressed even if the data is nominally stale.
    #[serde(rename = "first_fetch_grace_ms", with = "duration_ms")]
    pub first_fetch_grace: Duration,
}

impl CacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stale time.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set the GC delay.
    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    /// Set the post-first-fetch grace window.
    pub fn with_first_fetch_grace(mut self, grace: Duration) -> Self {
        self.first_fetch_grace = grace;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
            first_fetch_grace: DEFAULT_FIRST_FETCH_GRACE,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.stale_time, Duration::ZERO);
        assert_eq!(config.gc_time, Duration::from_secs(300));
        assert_eq!(config.first_fetch_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::new()
            .with_stale_time(Duration::from_secs(60))
            .with_gc_time(Duration::from_secs(600))
            .with_first_fetch_grace(Duration::ZERO);

        assert_eq!(config.stale_time, Duration::from_secs(60));
        assert_eq!(config.gc_time, Duration::from_secs(600));
        assert_eq!(config.first_fetch_grace, Duration::ZERO);
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: CacheConfig = serde_json::from_str(r#"{"stale_time_ms": 300000}"#).unwrap();
        assert_eq!(config.stale_time, Duration::from_secs(300));
        assert_eq!(config.gc_time, DEFAULT_GC_TIME);
        assert_eq!(config.first_fetch_grace, DEFAULT_FIRST_FETCH_GRACE);
    }

    #[test]
    fn test_serialize_as_millis() {
        let config = CacheConfig::new().with_stale_time(Duration::from_millis(1500));
        let json = serde_json::to_value(config).unwrap();
        assert_eq!(json["stale_time_ms"], 1500);
        assert_eq!(json["gc_time_ms"], 300_000);
    }

    #[test]
    fn test_serialize_rejects_unrepresentable_duration() {
        let config = CacheConfig::new().with_gc_time(Duration::MAX);
        assert!(serde_json::to_value(config).is_err());
    }
}
