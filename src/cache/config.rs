//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_GC_TIME_MS: u64 = 5 * 60 * 1000;

/// Store-wide settings for [`QueryCache`](super::QueryCache).
///
/// Durations deserialize from milliseconds; `u64::MAX` means "never".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window used when [`EnsureOptions`](super::EnsureOptions)
    /// does not set one. Zero means every `ensure` refetches.
    #[serde(rename = "default_stale_time_ms", deserialize_with = "millis")]
    pub default_stale_time: Duration,
    /// How long an entry without subscribers is kept before collection.
    #[serde(rename = "gc_time_ms", deserialize_with = "millis")]
    pub gc_time: Duration,
    /// Also notify subscribers when a fetch starts, not only when it settles.
    pub notify_on_loading: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::from_millis(DEFAULT_STALE_TIME_MS),
            gc_time: Duration::from_millis(DEFAULT_GC_TIME_MS),
            notify_on_loading: false,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    #[must_use]
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    #[must_use]
    pub fn notify_on_loading(mut self, enabled: bool) -> Self {
        self.notify_on_loading = enabled;
        self
    }

    /// `false` when collection is switched off entirely.
    pub(crate) fn gc_enabled(&self) -> bool {
        self.gc_time != Duration::MAX
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(if ms == u64::MAX {
        Duration::MAX
    } else {
        Duration::from_millis(ms)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.default_stale_time, Duration::ZERO);
        assert_eq!(config.gc_time, Duration::from_secs(300));
        assert!(!config.notify_on_loading);
        assert!(config.gc_enabled());
    }

    #[test]
    fn deserializes_milliseconds() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"default_stale_time_ms": 30000, "notify_on_loading": true}"#)
                .unwrap();
        assert_eq!(config.default_stale_time, Duration::from_secs(30));
        assert_eq!(config.gc_time, Duration::from_secs(300));
        assert!(config.notify_on_loading);
    }

    #[test]
    fn max_means_never() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"gc_time_ms": 18446744073709551615}"#).unwrap();
        assert_eq!(config.gc_time, Duration::MAX);
        assert!(!config.gc_enabled());
    }
}
