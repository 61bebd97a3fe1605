//! Configuration for the delta manager.
//!
//! Defaults carry the wire-observable constants of the protocol: reconnect
//! backoff bounds, gap-fill pacing and batch size, the split-content
//! threshold, and the ack debounce interval. `for_testing()` shrinks every
//! delay so suites that run on real time stay fast.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Master configuration for a delta manager instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaManagerConfig {
    /// Reconnect backoff configuration.
    pub reconnect: ReconnectConfig,
    /// Gap-fill fetch configuration.
    pub fetch: FetchConfig,
    /// Split-content configuration.
    pub content: ContentConfig,
    /// Debounce interval for reference-sequence-number acks (default:
    /// 100ms).
    #[serde(default = "default_ack_interval")]
    pub ack_interval: Duration,
}

fn default_ack_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for DeltaManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            fetch: FetchConfig::default(),
            content: ContentConfig::default(),
            ack_interval: default_ack_interval(),
        }
    }
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the second connect attempt (default: 1s). Doubles on
    /// each subsequent failure.
    pub initial_delay: Duration,
    /// Backoff ceiling (default: 8s).
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
        }
    }
}

/// Pacing and batching for delta storage fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Base delay after an empty or failed fetch (default: 100ms). Doubles
    /// per consecutive miss.
    pub missing_fetch_delay: Duration,
    /// Fetch backoff ceiling (default: 10s).
    pub max_fetch_delay: Duration,
    /// Maximum window width requested per storage call (default: 2000).
    pub max_batch_deltas: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            missing_fetch_delay: Duration::from_millis(100),
            max_fetch_delay: Duration::from_millis(10_000),
            max_batch_deltas: 2000,
        }
    }
}

/// Split-content thresholds and buffer sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// String payloads above this size are split onto the content channel
    /// (default: 32 KiB).
    pub max_content_size: usize,
    /// Content cache capacity in entries (default: 10). A tuning parameter,
    /// not a correctness limit: an evicted chunk is refetched from storage.
    pub buffer_size: usize,
    /// Default maximum message size when the connection does not report one
    /// (default: 16 KiB).
    pub chunk_size: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            max_content_size: 32_768,
            buffer_size: 10,
            chunk_size: 16_384,
        }
    }
}

impl DeltaManagerConfig {
    /// A configuration with every delay shrunk for fast test runs.
    pub fn for_testing() -> Self {
        Self {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(80),
            },
            fetch: FetchConfig {
                missing_fetch_delay: Duration::from_millis(5),
                max_fetch_delay: Duration::from_millis(50),
                max_batch_deltas: 2000,
            },
            content: ContentConfig::default(),
            ack_interval: Duration::from_millis(10),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err("reconnect.initial_delay must be <= reconnect.max_delay".to_string());
        }
        if self.fetch.missing_fetch_delay > self.fetch.max_fetch_delay {
            return Err("fetch.missing_fetch_delay must be <= fetch.max_fetch_delay".to_string());
        }
        if self.fetch.max_batch_deltas < 2 {
            return Err("fetch.max_batch_deltas must be >= 2".to_string());
        }
        if self.content.buffer_size == 0 {
            return Err("content.buffer_size must be > 0".to_string());
        }
        if self.content.max_content_size == 0 {
            return Err("content.max_content_size must be > 0".to_string());
        }
        if self.ack_interval.is_zero() {
            return Err("ack_interval must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DeltaManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(8000));
        assert_eq!(config.fetch.max_batch_deltas, 2000);
        assert_eq!(config.content.max_content_size, 32_768);
        assert_eq!(config.ack_interval, Duration::from_millis(100));
    }

    #[test]
    fn testing_config_is_valid_and_fast() {
        let config = DeltaManagerConfig::for_testing();
        assert!(config.validate().is_ok());
        assert!(config.reconnect.max_delay < Duration::from_millis(100));
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let mut config = DeltaManagerConfig::default();
        config.reconnect.initial_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = DeltaManagerConfig::default();
        config.content.buffer_size = 0;
        assert!(config.validate().is_err());
    }
}
