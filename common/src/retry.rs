//! Unified retry policy shared by the provisioner and the bootstrap pipeline.
//!
//! Every bounded retry loop in the project goes through one of these
//! policies instead of an ad hoc loop at the call site.

use log::warn;
use std::io::Error;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles per attempt, starting at `base`, never exceeding `cap`.
    Exponential { base: Duration, cap: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub const fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, cap },
        }
    }

    /// Single attempt, no sleeping.
    pub const fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to sleep after `failed_attempt` (1-based) before the next try.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, cap } => {
                let shift = failed_attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(cap)
            }
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted, sleeping the
    /// policy's backoff between tries. The last error is returned as-is.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{what} did not succeed (attempt {attempt}/{}): {e}; retrying in {}s",
                        self.max_attempts,
                        delay.as_secs()
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_succeeds_without_retry() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result = policy.run("noop", || {
            calls.set(calls.get() + 1);
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retries_until_success() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result = policy.run("flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::other("not yet"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result: Result<(), Error> = policy.run("doomed", || {
            calls.set(calls.get() + 1);
            Err(Error::other(format!("attempt {}", calls.get())))
        });
        assert_eq!(result.unwrap_err().to_string(), "attempt 3");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_once_never_sleeps() {
        let calls = Cell::new(0u32);
        let result: Result<(), Error> = RetryPolicy::once().run("oneshot", || {
            calls.set(calls.get() + 1);
            Err(Error::other("nope"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_secs(1),
            Duration::from_secs(8),
        );
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(9), Duration::from_secs(8));
    }
}
