//! Batching and retry configuration.

use crate::{DeliveryError, DeliveryResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default entry count that forces a flush on insert.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 5;

/// Default period of the unconditional flush timer.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10_000;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default exponential backoff base.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Configuration for [`BatchDeliveryEngine`](crate::BatchDeliveryEngine).
///
/// # Backoff Calculation
///
/// A failed entry with `retry_count = n` is re-inserted after
/// `base_delay_ms * 2^n`. With the defaults:
/// - 1st retry: 1s
/// - 2nd retry: 2s
/// - 3rd retry: 4s
/// - 4th failure: dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Entry count that forces a synchronous flush on insert.
    pub max_batch_size: usize,
    /// Period of the unconditional periodic flush, in milliseconds.
    pub flush_interval_ms: u64,
    /// Retry attempts after the first failure before dead-lettering.
    pub max_retries: u32,
    /// Backoff base in milliseconds.
    pub base_delay_ms: u64,
    /// Optional bound on a single sink call, in milliseconds.
    /// `None` lets a sink call run indefinitely.
    pub send_timeout_ms: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            send_timeout_ms: None,
        }
    }
}

impl BatchConfig {
    /// Check that the configuration can drive an engine.
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.max_batch_size == 0 {
            return Err(DeliveryError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(DeliveryError::Config(
                "flush_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms == 0 {
            return Err(DeliveryError::Config(
                "base_delay_ms must be at least 1".to_string(),
            ));
        }
        if self.send_timeout_ms == Some(0) {
            return Err(DeliveryError::Config(
                "send_timeout_ms must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Flush timer period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Backoff base.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Sink call bound, if any.
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }
}
