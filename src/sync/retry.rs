//! Retry policy and the single executor every remote call goes through.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::remote::RemoteError;

/// Exponential backoff with a cap, applied per failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 8_000,
    }
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
    Self {
      max_attempts,
      base_delay_ms,
      max_delay_ms,
    }
  }

  /// A single attempt, no backoff.
  pub fn no_retry() -> Self {
    Self::new(1, 0, 0)
  }

  /// Delay before the next attempt after `failures` failed attempts (0-based):
  /// `min(base * 2^failures, max)`.
  pub fn delay_for(&self, failures: u32) -> Duration {
    let factor = 2u64.checked_pow(failures).unwrap_or(u64::MAX);
    Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
  }

  fn attempts(&self) -> u32 {
    self.max_attempts.max(1)
  }
}

/// Every attempt failed, or the last failure was not worth retrying.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{operation} failed after {attempts} attempt(s): {last}")]
pub struct RetryExhausted {
  pub operation: String,
  pub attempts: u32,
  pub last: RemoteError,
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
///
/// Each attempt is bounded by `timeout`; a timeout counts as a retryable
/// transport failure.
pub async fn retry_with_backoff<T, F, Fut>(
  policy: &RetryPolicy,
  timeout: Duration,
  operation: &str,
  mut call: F,
) -> Result<T, RetryExhausted>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, RemoteError>>,
{
  let attempts = policy.attempts();
  let mut attempt = 0;

  loop {
    attempt += 1;

    let result = match tokio::time::timeout(timeout, call()).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Timeout(timeout)),
    };

    match result {
      Ok(value) => {
        if attempt > 1 {
          debug!(operation, attempt, "remote call succeeded after retry");
        }
        return Ok(value);
      }
      Err(e) if e.is_retryable() && attempt < attempts => {
        let delay = policy.delay_for(attempt - 1);
        warn!(
          operation,
          attempt,
          error = %e,
          delay_ms = delay.as_millis() as u64,
          "remote call failed, retrying"
        );
        tokio::time::sleep(delay).await;
      }
      Err(e) => {
        return Err(RetryExhausted {
          operation: operation.to_string(),
          attempts: attempt,
          last: e,
        });
      }
    }
  }
}
