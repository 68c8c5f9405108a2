// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded retry with linear backoff.

use std::time::Duration;
use tracing::warn;

/// Bounded retry policy.
///
/// Runs an operation up to a fixed number of attempts. After failed attempt
/// `n` the policy waits `base_delay * n` before trying again, so the delay
/// grows linearly. No delay follows the final attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Construct new linear backoff policy.
    ///
    /// A policy always performs at least one attempt.
    pub fn linear(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Maximum number of attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait after given failed attempt number.
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.checked_mul(attempt).unwrap_or(Duration::MAX)
    }

    /// Run operation until it succeeds or all attempts are used up.
    ///
    /// The operation receives the 1-based attempt number. The `sleep`
    /// callback performs the wait between attempts.
    ///
    /// # Errors
    ///
    /// - Return [`Exhausted`] holding the last error if every attempt fails.
    pub fn run<T, E, F, S>(&self, mut operation: F, mut sleep: S) -> Result<T, Exhausted<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
        S: FnMut(Duration),
    {
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.attempts => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last: error,
                    })
                }
                Err(error) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "attempt {attempt}/{} failed: {error}; retrying in {}s",
                        self.attempts,
                        delay.as_secs()
                    );
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Every attempt of a retried operation failed.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct Exhausted<E>
where
    E: std::fmt::Display,
{
    /// Number of attempts performed.
    pub attempts: u32,

    /// Error of final attempt.
    pub last: E,
}
