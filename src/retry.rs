//! Bounded retry with exponential backoff and jitter.
//!
//! Only transient-looking failures are retried: errors that classify themselves as
//! transient, or whose message matches one of the configured patterns. Everything else
//! is returned on the first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{FarmError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the base delay added at random (0.3 = up to +30%)
    pub jitter: f64,
    /// Case-insensitive substrings marking an error message as retryable
    pub retryable_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter: 0.3,
            retryable_patterns: ["network", "timeout", "ECONNRESET", "ETIMEDOUT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits, for tests and latency-critical callers.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Base delay before attempt `attempt + 1` (attempts are 1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * exp;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter) * base.as_millis() as f64;
        base + Duration::from_millis(extra as u64)
    }

    pub fn is_retryable(&self, err: &FarmError) -> bool {
        if err.is_transient() {
            return true;
        }
        // Permanent failures never match by message
        if matches!(
            err,
            FarmError::PermanentWrite(_) | FarmError::Validation(_) | FarmError::NotFound { .. }
        ) {
            return false;
        }
        let message = err.to_string().to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|p| message.contains(&p.to_lowercase()))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !self.is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_with_jitter(attempt);
                    warn!(
                        "[retry] {} attempt {}/{} failed, retrying in {}ms: {}",
                        label,
                        attempt,
                        max_attempts,
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
