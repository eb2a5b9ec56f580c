//! Bounded retry with backoff.
//!
//! Everything that waits on the filesystem to settle (opening a file the
//! writer still holds, polling a file until its size stops moving) goes
//! through [`RetryPolicy`], so the number of attempts is always finite and
//! the delays run on tokio time (tests pause the clock instead of sleeping).

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Attempt budget and delay curve for a retried operation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Growth factor applied after every failed attempt. `1.0` gives fixed
    /// intervals.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy: `max_attempts` tries spaced `interval` apart.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        let interval_ms = interval.as_millis().min(u64::MAX as u128) as u64;
        Self {
            max_attempts,
            initial_delay_ms: interval_ms,
            max_delay_ms: interval_ms,
            multiplier: 1.0,
        }
    }

    /// Fixed-interval policy that keeps polling for roughly `timeout`.
    pub fn polling(interval: Duration, timeout: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = (timeout.as_millis() / interval_ms).saturating_add(1);
        Self::fixed(interval, attempts.clamp(2, u32::MAX as u128) as u32)
    }

    /// Delay to wait after `failures` failed attempts (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let raw = (self.initial_delay_ms as f64 * factor)
            .min(self.max_delay_ms as f64);
        Duration::from_millis(raw as u64)
    }

    /// The delays between consecutive attempts; yields `max_attempts - 1`
    /// values.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts.max(1)).map(|failures| self.delay_for(failures))
    }
}

/// Last error of an operation that never succeeded.
#[derive(Debug)]
pub struct RetryError<E> {
    pub last: E,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a permanent error, or the policy
/// runs out of attempts. `is_transient` decides which errors are retried.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut op: F,
    is_transient: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delays = policy.delays();
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => match delays.next() {
                Some(delay) => {
                    debug!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(RetryError { last: err, attempts }),
            },
            Err(err) => return Err(RetryError { last: err, attempts }),
        }
    }
}
