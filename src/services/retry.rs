//! Bounded retry for collaborator calls.
//!
//! Each attempt runs under a timeout. Errors whose `ErrorCode::retryable`
//! is false end the loop at once; transient ones are retried with a
//! linear, jittered back-off.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::frame::ErrorCode;

pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_ATTEMPTS: usize = 2;
pub const DEFAULT_RETRY_BASE_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: usize,
    pub timeout: Duration,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            base_delay_ms: DEFAULT_RETRY_BASE_MS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("timed out after {attempts} attempt(s)")]
    TimedOut { attempts: usize },
}

/// Run `call` until it succeeds, fails permanently, or the policy is spent.
///
/// # Errors
///
/// `Failed` with the last error, or `TimedOut` if the final attempt
/// timed out.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, op: &'static str, mut call: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorCode,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.retryable() => return Err(RetryError::Failed(e)),
            Ok(Err(e)) => {
                warn!(op, attempt, total = attempts, error = %e, "collaborator call failed");
                last = Some(RetryError::Failed(e));
            }
            Err(_) => {
                warn!(op, attempt, total = attempts, "collaborator call timed out");
                last = Some(RetryError::TimedOut { attempts: attempt });
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff(policy.base_delay_ms, attempt)).await;
        }
    }
    Err(last.unwrap_or(RetryError::TimedOut { attempts }))
}

fn backoff(base_ms: u64, attempt: usize) -> Duration {
    let jitter = if base_ms == 0 { 0 } else { rand::rng().random_range(0..=base_ms) };
    Duration::from_millis(base_ms * attempt as u64 + jitter)
}

#[cfg(test)]
#[path = "retry_test.rs"]
mod tests;
