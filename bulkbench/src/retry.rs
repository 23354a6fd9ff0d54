//! Exponential backoff around store calls.
//!
//! Only errors for which [`StoreError::is_retryable`] holds are retried.
//! Everything else is returned on the first attempt, because resending a
//! batch with a conflicting key or a bad schema fails the same way.
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: initial_backoff
//! attempt 3: initial_backoff * multiplier
//! ...        capped at max_backoff
//! ```

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::db::StoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: usize,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    #[cfg(test)]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = backoff.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries. `what` names the call in log lines.
pub fn retry_with_backoff<T, F>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => {
                if attempt > 0 {
                    debug!(what, attempts = attempt + 1, "succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let backoff = policy.backoff_for_attempt(attempt);
                warn!(
                    what,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    ?backoff,
                    error = %e,
                    "retrying"
                );
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
