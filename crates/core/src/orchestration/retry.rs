//! # Retry Policy
//!
//! Re-invocation of a single required call with bounded exponential backoff.
//! A call exceeding `call_timeout` counts as a transient failure.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::config::duration_ms;

/// Errors that know whether another attempt can help
pub trait Retryable: Sized {
    fn is_retryable(&self) -> bool;

    /// Error to report when an attempt exceeded the per-call timeout
    fn timed_out(after: Duration) -> Self;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "duration_ms")]
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    #[serde(with = "duration_ms")]
    pub maximum_interval: Duration,
    /// Total attempts including the first
    pub maximum_attempts: u32,
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(5),
            maximum_attempts: 5,
            call_timeout: Duration::from_secs(35),
        }
    }
}

impl RetryPolicy {
    /// No backoff, for tests and local runs
    pub fn immediate(maximum_attempts: u32) -> Self {
        Self {
            initial_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            maximum_interval: Duration::ZERO,
            maximum_attempts,
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Sleep after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = secs.min(self.maximum_interval.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_when(label, E::is_retryable, op).await
    }

    /// Like `run`, with a caller-chosen predicate deciding what is retried.
    pub async fn run_when<T, E, P, F, Fut>(&self, label: &str, retry_if: P, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.maximum_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.call_timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && retry_if(&e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(call = label, attempt, max_attempts = attempts, delay_ms = delay.as_millis() as u64, error = %e, "Retrying call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if retry_if(&e) {
                        tracing::error!(call = label, attempts, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
