//! Bounded retry with exponential backoff, for idempotent queries only.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before attempt `attempt` (1-based; the first retry is attempt 2).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(20);
        let delay = self.base_delay_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Runs `op` until it succeeds or attempts are exhausted.
    ///
    /// Returns the last error together with the number of attempts made.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err((e, attempt)),
                Err(e) => {
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    tracing::debug!(what, attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), error = %e, "retrying");
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(350));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, (String, u32)> = RetryPolicy::immediate(3).run("status", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("flaky".to_string())
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), (String, u32)> = RetryPolicy::immediate(2).run("status", || {
            calls.set(calls.get() + 1);
            Err("down".to_string())
        });
        let (err, attempts) = result.unwrap_err();
        assert_eq!(err, "down");
        assert_eq!(attempts, 2);
        assert_eq!(calls.get(), 2);
    }
}
