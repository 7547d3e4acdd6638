//! Bounded exponential backoff with jitter.
//!
//! The delay before retry `n` (1-based) is `base × 2^(n-1)`, capped at
//! `max`, then scaled by a random factor in `[0.5, 1.0]`. Only transient
//! failures ([`Error::is_transient`]) are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use snapmind_core::error::{Error, Result};

use crate::cancel::CancellationToken;
use crate::config::IndexingConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(4000),
        }
    }
}

impl From<&IndexingConfig> for RetryPolicy {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let scale: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        self.backoff(retry).mul_f64(scale)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Each attempt gets its own `timeout`; an elapsed attempt counts as a
/// transient [`Error::Timeout`]. Cancellation is checked between attempts
/// and while sleeping.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation,
                millis: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = policy.jittered(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
