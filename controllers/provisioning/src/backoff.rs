//! # Backoff
//!
//! Retry pacing used by the controller:
//! - [`FibonacciBackoff`]: per-request requeue delay after transient reconcile
//!   errors (1m, 1m, 2m, 3m, 5m, 8m, 10m max)
//! - [`retry_on_conflict`]: bounded retry of optimistic-concurrency writes
//! - [`retry_with_backoff`]: doubling delay for plugin client initialization,
//!   aborted by a [`CancellationToken`]

use crate::error::ControllerError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fibonacci backoff calculator
///
/// Calculations are performed in minutes, then converted to seconds for the
/// requeue action.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    prev_minutes: u64,
    current_minutes: u64,
    max_minutes: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in minutes
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            prev_minutes: 0,
            current_minutes: min_minutes,
            max_minutes,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result_seconds = self.current_minutes * 60;

        let next_minutes = self.prev_minutes + self.current_minutes;
        self.prev_minutes = self.current_minutes;
        self.current_minutes = std::cmp::min(next_minutes, self.max_minutes);

        result_seconds
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
    }
}

/// Attempts made by [`retry_on_conflict`]
pub const CONFLICT_RETRY_STEPS: u32 = 5;
/// Pause between conflict retries
pub const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Runs `op` until it succeeds, fails with something other than a conflict,
/// or [`CONFLICT_RETRY_STEPS`] attempts are used up.
///
/// `op` must re-read the object it writes so each attempt carries a fresh
/// resourceVersion.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(ControllerError::Store(e)) if e.is_conflict() && attempt < CONFLICT_RETRY_STEPS => {
                debug!("Conflict on attempt {}: {}", attempt, e);
                attempt += 1;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

/// Runs `op` up to `attempts` times, sleeping `base_delay`, `2 * base_delay`, ...
/// between attempts. The sleep is abandoned when `cancel` fires.
pub async fn retry_with_backoff<T, F, Fut>(
    what: &str,
    attempts: u32,
    base_delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                return Err(ControllerError::internal(format!(
                    "{} failed after {} attempts: {}",
                    what, attempts, e
                )));
            }
            Err(e) => {
                warn!("{} failed (attempt {}/{}), retrying in {:?}: {}", what, attempt, attempts, delay, e);
                tokio::select! {
                    () = cancel.cancelled() => return Err(ControllerError::Cancelled(what.to_string())),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                delay = delay.saturating_mul(2);
            }
        }
    }
}
