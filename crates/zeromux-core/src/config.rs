//! Streamer configuration
//!
//! Defaults reproduce the pipeline's fixed constants: five header retries
//! one second apart and 17 ms byte stream pacing.

use crate::{retry::RetryPolicy, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of header download retries after the first attempt
pub const HEADER_RETRIES: u32 = 5;

/// Fixed pause between header download attempts
pub const HEADER_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Byte stream pacing delay, roughly one animation frame
pub const PACING_DELAY: Duration = Duration::from_millis(17);

/// Streamer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Header (moov) download retries after the first attempt
    pub header_retries: u32,
    /// Fixed delay between header attempts (ms)
    pub header_retry_delay_ms: u64,
    /// Delay between byte stream emissions (ms)
    pub pacing_delay_ms: u64,
    /// Segments fetched ahead of the feed loop
    pub prefetch_depth: usize,
    /// Retries per segment download
    pub segment_retries: u32,
    /// Fixed delay between segment attempts (ms)
    pub segment_retry_delay_ms: u64,
    /// Request timeout for the HTTP transport (ms)
    pub request_timeout_ms: u64,
    /// Feed loop backpressure policy
    pub feed: FeedPolicy,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            header_retries: HEADER_RETRIES,
            header_retry_delay_ms: HEADER_RETRY_DELAY.as_millis() as u64,
            pacing_delay_ms: PACING_DELAY.as_millis() as u64,
            prefetch_depth: 3,
            segment_retries: 3,
            segment_retry_delay_ms: 500,
            request_timeout_ms: 30_000,
            feed: FeedPolicy::default(),
        }
    }
}

impl StreamerConfig {
    /// Load configuration from a JSON document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: StreamerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.prefetch_depth == 0 {
            return Err(Error::InvalidConfig("prefetch_depth must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("request_timeout_ms must be positive".into()));
        }
        self.feed.validate()
    }

    pub fn header_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.header_retries,
            Duration::from_millis(self.header_retry_delay_ms),
        )
    }

    pub fn segment_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.segment_retries,
            Duration::from_millis(self.segment_retry_delay_ms),
        )
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Backpressure policy of the feed loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedPolicy {
    /// Maximum media buffered ahead of the playback position (seconds)
    pub ahead_horizon: f64,
    /// Media kept behind the playback position before eviction (seconds)
    pub back_buffer: f64,
    /// Wait between attempts while the sink is saturated (ms)
    pub idle_interval_ms: u64,
}

impl Default for FeedPolicy {
    fn default() -> Self {
        Self {
            ahead_horizon: 30.0,
            back_buffer: 10.0,
            idle_interval_ms: 250,
        }
    }
}

impl FeedPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.ahead_horizon.is_nan() || self.ahead_horizon <= 0.0 {
            return Err(Error::InvalidConfig("feed.ahead_horizon must be positive".into()));
        }
        if self.back_buffer < 0.0 {
            return Err(Error::InvalidConfig("feed.back_buffer must not be negative".into()));
        }
        if self.idle_interval_ms == 0 {
            return Err(Error::InvalidConfig("feed.idle_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamerConfig::default();
        assert_eq!(config.header_retries, 5);
        assert_eq!(config.header_retry_delay_ms, 1000);
        assert_eq!(config.pacing_delay(), Duration::from_millis(17));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = StreamerConfig::from_json(r#"{"prefetch_depth": 5, "feed": {"ahead_horizon": 12.0}}"#).unwrap();
        assert_eq!(config.prefetch_depth, 5);
        assert_eq!(config.feed.ahead_horizon, 12.0);
        assert_eq!(config.feed.back_buffer, 10.0);
        assert_eq!(config.header_retries, 5);
    }

    #[test]
    fn test_invalid() {
        assert!(StreamerConfig::from_json(r#"{"prefetch_depth": 0}"#).is_err());
        assert!(StreamerConfig::from_json(r#"{"feed": {"ahead_horizon": 0.0}}"#).is_err());
    }
}
