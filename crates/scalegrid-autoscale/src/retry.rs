//! Generic retry executor with fixed or exponential delays.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use scalegrid_state::{ActionHttp, DelayType, ValidationError};
use tracing::debug;

/// Upper bound on a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay: Duration,
    pub delay_type: DelayType,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            delay_type: DelayType::Fixed,
        }
    }

    pub fn backoff(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            delay_type: DelayType::Backoff,
        }
    }

    /// Retry parameters declared on an action.
    pub fn from_action(action: &ActionHttp) -> Result<Self, ValidationError> {
        Ok(Self {
            attempts: action.attempts.max(1),
            delay: action.delay_duration()?,
            delay_type: action.delay_type,
        })
    }

    /// Wait before retry number `retry` (0 for the wait after the first
    /// failure).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.delay_type {
            DelayType::Fixed => self.delay,
            DelayType::Backoff => {
                let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor).min(MAX_DELAY)
            }
        }
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects,
/// or the attempts are used up. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                let wait = policy.delay_for(attempt - 1);
                debug!(attempt, attempts, ?wait, error = %e, "retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
