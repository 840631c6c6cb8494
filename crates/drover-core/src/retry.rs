use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff policy for automatically retried queue entries.
///
/// The delay before retry attempt `n` (counting from zero) is
/// `min(max_delay, base_delay * 2^n)`, optionally scaled by a uniform jitter
/// factor in `[0.5, 1.0]` so a burst of simultaneous failures does not come
/// back as a burst of simultaneous retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Upper bound on any single retry delay, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Whether to apply jitter to the computed delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    300
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy with no delay at all. Retried entries become claimable
    /// immediately — useful in tests.
    pub fn immediate() -> Self {
        Self {
            base_delay_secs: 0,
            max_delay_secs: 0,
            jitter: false,
        }
    }

    /// Computes the delay before the given retry attempt (zero-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(32);
        let uncapped = self.base_delay_secs.saturating_mul(1u64 << exponent);
        let capped = uncapped.min(self.max_delay_secs);
        let millis = if self.jitter && capped > 0 {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            ((capped * 1000) as f64 * factor) as i64
        } else {
            (capped * 1000) as i64
        };
        Duration::milliseconds(millis)
    }
}
