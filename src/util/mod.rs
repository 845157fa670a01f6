//! Utility module
//!
//! Shared helpers used throughout the library.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::core::Result;

/// Bounded retry policy for transport-level failures
///
/// Retries only errors classified retryable by `Error::is_retryable`, with
/// linear backoff between attempts. Callers choose the bound; nothing in the
/// crate retries on its own.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Base delay between attempts, scaled by the attempt number
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; at least one attempt is always made
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` until it succeeds, fails non-retryably, or the attempt
    /// budget is spent. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let result = policy
            .run(|attempt| {
                calls.set(calls.get() + 1);
                async move {
                    if attempt < 3 {
                        Err(Error::TimedOut)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: Result<()> = policy
            .run(|_| {
                calls.set(calls.get() + 1);
                async { Err(Error::ConnectionLost) }
            })
            .await;

        assert!(matches!(result, Err(Error::ConnectionLost)));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let result: Result<()> = policy
            .run(|_| {
                calls.set(calls.get() + 1);
                async { Err(Error::AlreadyStarted) }
            })
            .await;

        assert!(matches!(result, Err(Error::AlreadyStarted)));
        assert_eq!(calls.get(), 1);
    }
}
