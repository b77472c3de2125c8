use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rollcall_core::config::RetryConfig;
use tracing::{info, warn};

use crate::error::{ResilienceError, Transient};

/// How often and how patiently to retry one logical call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random term added to each delay.
    pub jitter: Duration,
    /// Applied to every attempt; expiry counts as a transient failure.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), None)
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig, attempt_timeout: Option<Duration>) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: Duration::from_millis(cfg.jitter_ms),
            attempt_timeout,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry(attempt_timeout: Option<Duration>) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            attempt_timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Deterministic part of the delay after the `failed`-th failure:
    /// `base · 2^(failed-1)`, capped at `max_delay`.
    pub fn backoff(&self, failed: u32) -> Duration {
        let factor = 1u32.checked_shl(failed.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_with_jitter(&self, failed: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.backoff(failed) + Duration::from_millis(jitter)
    }
}

/// Run `op` until it succeeds, fails definitively, or attempts run out.
///
/// Only errors whose [`Transient::is_transient`] is true are retried. A
/// server `retry_after` hint lengthens the wait (never beyond `max_delay`).
/// Backoff uses `tokio::time::sleep`, so other tasks keep running meanwhile.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ResilienceError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(res) => res.map_err(ResilienceError::Call),
                Err(_) => Err(ResilienceError::Timeout {
                    ms: limit.as_millis() as u64,
                }),
            },
            None => op().await.map_err(ResilienceError::Call),
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    info!(call = label, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_transient() {
            warn!(call = label, attempt, error = %err, "definitive failure, not retrying");
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(call = label, attempts = attempt, error = %err, "retries exhausted");
            return Err(err);
        }

        let mut delay = policy.delay_with_jitter(attempt);
        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint.min(policy.max_delay));
        }
        warn!(
            call = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
