//! Configuration for a cache queue.
//!
//! # Example
//!
//! ```
//! use cache_queue::CacheQueueConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CacheQueueConfig::default();
//! assert_eq!(config.max_bytes, 10 * 1024 * 1024); // 10 MiB
//!
//! // Cache limits never exceed the queue limits
//! let config = CacheQueueConfig {
//!     max_entries: 100,
//!     max_entries_cache: 5000,
//!     sql_url: Some("sqlite://queue.db".into()),
//!     ..Default::default()
//! };
//! assert_eq!(config.cache_limits().max_entries, 100);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::retry::RetryPreset;
use crate::storage::StoreLimits;

/// Limits and backing store settings for one cache queue.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheQueueConfig {
    /// Maximum entries in the whole queue (persistent store capacity)
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,

    /// Maximum bytes in the whole queue (default: 10 MiB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Maximum entries held in the memory cache
    #[serde(default = "default_max_entries_cache")]
    pub max_entries_cache: u64,

    /// Maximum bytes held in the memory cache (default: 2 MiB)
    #[serde(default = "default_max_bytes_cache")]
    pub max_bytes_cache: u64,

    /// SQLite connection string for the persistent store (e.g. "sqlite://queue.db")
    #[serde(default)]
    pub sql_url: Option<String>,

    /// Retry schedule used when connecting the persistent store
    #[serde(default)]
    pub persistent_retry: RetryPreset,

    /// Health probe interval of the persistent store in milliseconds (0 = disabled)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_max_entries() -> u64 { 1000 }
fn default_max_bytes() -> u64 { 10 * 1024 * 1024 } // 10 MiB
fn default_max_entries_cache() -> u64 { 1000 }
fn default_max_bytes_cache() -> u64 { 2 * 1024 * 1024 } // 2 MiB
fn default_probe_interval_ms() -> u64 { 5000 }

impl Default for CacheQueueConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            max_entries_cache: default_max_entries_cache(),
            max_bytes_cache: default_max_bytes_cache(),
            sql_url: None,
            persistent_retry: RetryPreset::default(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl CacheQueueConfig {
    /// Capacity of the persistent store, which is the logical queue capacity.
    #[must_use]
    pub fn persistent_limits(&self) -> StoreLimits {
        StoreLimits::new(self.max_entries, self.max_bytes)
    }

    /// Capacity of the memory cache, clamped to the queue capacity.
    #[must_use]
    pub fn cache_limits(&self) -> StoreLimits {
        StoreLimits::new(self.max_entries_cache, self.max_bytes_cache).clamp_to(self.persistent_limits())
    }

    #[must_use]
    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_ms > 0).then(|| Duration::from_millis(self.probe_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheQueueConfig::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.max_bytes, 10_485_760);
        assert_eq!(config.max_entries_cache, 1000);
        assert_eq!(config.max_bytes_cache, 2_097_152);
        assert!(config.sql_url.is_none());
        assert_eq!(config.persistent_retry, RetryPreset::Startup);
        assert_eq!(config.probe_interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: CacheQueueConfig = serde_json::from_str(
            r#"{"max_entries": 50, "sql_url": "sqlite://q.db", "persistent_retry": "query", "probe_interval_ms": 0}"#,
        )
        .unwrap();

        assert_eq!(config.max_entries, 50);
        assert_eq!(config.max_bytes_cache, 2 * 1024 * 1024);
        assert_eq!(config.sql_url.as_deref(), Some("sqlite://q.db"));
        assert_eq!(config.persistent_retry, RetryPreset::Query);
        assert!(config.probe_interval().is_none());
    }

    #[test]
    fn test_cache_limits_are_clamped() {
        let config = CacheQueueConfig {
            max_entries: 10,
            max_bytes: 1_000,
            max_entries_cache: 20,
            max_bytes_cache: 500,
            ..Default::default()
        };

        assert_eq!(config.cache_limits(), StoreLimits::new(10, 500));
        assert_eq!(config.persistent_limits(), StoreLimits::new(10, 1_000));
    }
}
