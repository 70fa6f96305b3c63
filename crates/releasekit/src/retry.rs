//! Bounded retry with backoff.
//!
//! Only read-only operations are retried automatically (preflight probes,
//! health checks, service status polls). Mutating remote calls fail once.

use crate::error::{Error, Result};
use std::thread;
use std::time::Duration;

/// Retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied per attempt (1.0 = constant delay)
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Constant delay between a fixed number of attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            backoff_factor: 1.0,
            max_delay: delay,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called before sleeping ahead of the next attempt.
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration);
}

/// Logs retries at warn level.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration) {
        log::warn!(
            "attempt {attempt}/{max_attempts} failed: {error}; retrying in {}s",
            delay.as_secs()
        );
    }
}

/// Execute an operation, retrying errors that are retryable.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                if let Some(cb) = callback {
                    cb.on_retry(attempt + 1, attempts, &e, delay);
                }
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Poll `check` until it returns true or the attempts run out.
pub fn poll_until<F>(config: &RetryConfig, mut check: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let attempts = config.max_attempts.max(1);
    for attempt in 0..attempts {
        if check()? {
            return Ok(true);
        }
        if attempt + 1 < attempts {
            thread::sleep(config.delay_for_attempt(attempt));
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick(attempts: u32) -> RetryConfig {
        RetryConfig::fixed(attempts, Duration::from_millis(1))
    }

    fn transient() -> Error {
        Error::Http {
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(10));
        assert_eq!(RetryConfig::fixed(3, Duration::from_secs(2)).delay_for_attempt(4), Duration::from_secs(2));
    }

    #[test]
    fn test_non_retryable_error_fails_once() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&quick(5), None, || {
            calls.set(calls.get() + 1);
            Err(Error::config("bad"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_eventual_success() {
        let calls = Cell::new(0);
        let result = with_retry(&quick(3), None, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(transient()) } else { Ok(42) }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_callback_invoked_between_attempts() {
        struct Counting(Cell<u32>);
        impl RetryCallback for Counting {
            fn on_retry(&self, _: u32, _: u32, _: &Error, _: Duration) {
                self.0.set(self.0.get() + 1);
            }
        }
        let cb = Counting(Cell::new(0));
        let _: Result<()> = with_retry(&quick(3), Some(&cb), || Err(transient()));
        assert_eq!(cb.0.get(), 2);
    }

    #[test]
    fn test_poll_until() {
        let calls = Cell::new(0);
        let ok = poll_until(&quick(10), || {
            calls.set(calls.get() + 1);
            Ok(calls.get() == 4)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(calls.get(), 4);

        assert!(!poll_until(&quick(2), || Ok(false)).unwrap());
    }
}
