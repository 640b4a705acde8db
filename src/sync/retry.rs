//! Bounded exponential backoff around fallible I/O.
//!
//! Generic failures back off on `base * 2^n`; throttling responses back off on
//! the steeper `base * 3^n`. `n` is the 0-based index of the failure. The
//! exponential part is capped at `max_delay`; uniform jitter in
//! `[0, jitter_range]` is added on top. A server `Retry-After` raises the delay
//! to at least that value.

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::infrastructure::config::RetryConfig;

const GENERIC_FACTOR: u64 = 2;
const RATE_LIMIT_FACTOR: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_range: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_range: Duration::from_millis(config.jitter_range_ms),
        }
    }

    /// Deterministic policy for tests and tight loops
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_range = Duration::ZERO;
        self
    }

    /// Capped exponential part of the delay after failure `attempt`
    #[must_use]
    pub fn backoff(&self, attempt: u32, rate_limited: bool) -> Duration {
        let factor = if rate_limited { RATE_LIMIT_FACTOR } else { GENERIC_FACTOR };
        let multiplier = factor.saturating_pow(attempt);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }

    /// Full delay before retrying after `error`, jitter included
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &SyncError) -> Duration {
        let jitter_ms = u64::try_from(self.jitter_range.as_millis()).unwrap_or(0);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };

        let computed = self.backoff(attempt, error.is_rate_limited()) + jitter;
        error
            .retry_after()
            .map_or(computed, |server| computed.max(server))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` calls have failed; then returns the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("✅ {} succeeded after {} retries", label, attempt);
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                if attempt + 1 >= max_attempts {
                    warn!("❌ {} failed after {} attempts: {}", label, max_attempts, error);
                    return Err(error);
                }
                let delay = policy.delay_for(attempt, &error);
                warn!(
                    "🔄 {} failed (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    max_attempts,
                    delay,
                    error
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
