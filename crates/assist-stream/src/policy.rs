use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff for persistence calls.
///
/// `max_retries` counts attempts after the first one; a policy with
/// `max_retries = 0` tries exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_initial_backoff_ms() -> u64 {
    250
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, default_initial_backoff_ms(), default_backoff_factor())
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    /// Zero or negative inputs fall back to the defaults.
    pub fn exponential(max_retries: u32, initial_backoff_ms: u64, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: if initial_backoff_ms == 0 {
                default_initial_backoff_ms()
            } else {
                initial_backoff_ms
            },
            backoff_factor: if backoff_factor > 0.0 {
                backoff_factor
            } else {
                default_backoff_factor()
            },
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms.max(1);
        self
    }

    /// Total attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Delay before retry number `retries_done + 1`.
    pub fn backoff_duration(&self, retries_done: u32) -> Duration {
        if self.max_retries == 0 {
            return Duration::ZERO;
        }
        let scaled = self.initial_backoff_ms as f64 * self.backoff_factor.powi(retries_done as i32);
        let capped = scaled.min(self.max_backoff_ms.max(1) as f64);
        Duration::from_millis(capped.round() as u64)
    }
}
