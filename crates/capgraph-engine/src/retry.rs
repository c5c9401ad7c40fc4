//! Bounded retries for skill attempts.

use std::future::Future;
use std::time::Duration;

use capgraph_types::{CapgraphError, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// How long to wait before the next skill attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same wait before every retry. Used for a graph-level `retry_delay`.
    Fixed(Duration),
    /// `base` doubled per retry, never above `max`.
    Exponential { base: Duration, max: Duration },
    None,
}

impl BackoffPolicy {
    /// Wait after the failed attempt numbered `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.min(31) as u32);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    /// 500ms, 1s, 2s, ... capped at 30s.
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Value produced by [`execute_with_retry`] plus how many retries it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub retries: usize,
}

/// Failure from [`execute_with_retry`], carrying the retries spent before it.
#[derive(Debug)]
pub struct RetryError {
    pub error: CapgraphError,
    pub retries: usize,
}

/// Run `attempt_fn` until it succeeds, fails permanently, or retries run out.
///
/// `attempt_fn` receives the zero-based attempt number and is called up to
/// `max_retries + 1` times. Only errors satisfying
/// [`CapgraphError::is_retryable`] are retried. Backoff sleeps are raced
/// against `cancel`; cancellation ends the loop with [`CapgraphError::Cancelled`].
/// `on_retry` is told about each retry before its backoff starts.
pub async fn execute_with_retry<T, F, Fut>(
    attempt_fn: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    node_id: &str,
    cancel: &CancellationToken,
    mut on_retry: impl FnMut(usize, Duration),
) -> std::result::Result<Retried<T>, RetryError>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    retries: attempt,
                })
            }
            Err(error) if attempt < max_retries && error.is_retryable() => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    node = %node_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, backing off"
                );
                on_retry(attempt + 1, delay);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(RetryError { error: CapgraphError::Cancelled, retries: attempt });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(error) => {
                return Err(RetryError {
                    error,
                    retries: attempt,
                })
            }
        }
    }
}
