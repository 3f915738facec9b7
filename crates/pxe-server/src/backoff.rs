//! # Fibonacci Backoff
//!
//! Progressive retry delays for binding the UDP listeners. The provisioning
//! interface is frequently still coming up when the daemon starts, so a bind
//! failure is retried rather than fatal.
//!
//! Sequence: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 30s (max).

use crate::error::PxeError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - First two delays (typically 1)
    /// * `max_seconds` - Cap for the sequence (typically 30)
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, 30)
    }
}

/// Run `attempt` until it succeeds or `max_attempts` is reached, sleeping
/// with Fibonacci backoff between failures.
///
/// # Arguments
///
/// * `what` - Label for log lines, e.g. `DHCP socket 0.0.0.0:67`
/// * `max_attempts` - Total attempts including the first
/// * `backoff` - Delay sequence
/// * `attempt` - Produces one attempt
///
/// # Returns
///
/// The first successful value, or the last error
pub async fn retry_with_backoff<T, F, Fut>(
    what: &str,
    max_attempts: u32,
    mut backoff: FibonacciBackoff,
    mut attempt: F,
) -> Result<T, PxeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PxeError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if tries >= max_attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_backoff();
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {}s",
                    what,
                    tries,
                    max_attempts,
                    e,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
