use rand::Rng;
use std::time::Duration;

use crate::config::ResilienceConfig;

/// Exponential backoff with full jitter.
///
/// The i-th retry waits `min(max_delay, base · backoff_base^i)` stretched by
/// a uniform factor in `[1 − jitter, 1 + jitter]`. `max_retries` counts
/// retries after the initial attempt, so a policy allows
/// `max_retries + 1` attempts in total.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_base: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            backoff_base: config.backoff_base(),
            jitter: config.jitter(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Deterministic delay for the i-th retry, before jitter.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let exp = self.backoff_base.powi(retry_index as i32);
        let delay = self.base_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Delay for the i-th retry with jitter applied.
    pub fn jittered_delay(&self, retry_index: u32) -> Duration {
        let base = self.backoff_delay(retry_index).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}
