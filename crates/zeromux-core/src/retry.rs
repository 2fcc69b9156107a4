//! Fixed-delay retry with cancellation
//!
//! Each attempt is started only after the previous one has failed and the
//! delay has elapsed, so attempts never overlap.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Countdown retry policy with a constant delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Pause before each retry
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error
    Exhausted { attempts: u32, last: E },
    /// The token was cancelled while attempting or waiting
    Cancelled,
}

/// Run `op` until it succeeds, the retry budget runs out, or `cancel` fires.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_fixed<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt >= policy.max_attempts() => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            Err(error) => {
                warn!(
                    what,
                    attempt,
                    retries_left = policy.max_attempts() - attempt,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = sleep(policy.delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1000));
        let cancel = CancellationToken::new();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let result = retry_fixed(policy, &cancel, "test", |attempt| {
            let starts = starts.clone();
            async move {
                starts.lock().unwrap().push(Instant::now());
                if attempt <= 3 {
                    Err("boom")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1000));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_fixed(policy, &cancel, "test", |_| async { Err("nope") }).await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last, "nope");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1000));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(Mutex::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let counter = attempts.clone();
        let result: Result<(), _> = retry_fixed(policy, &cancel, "test", |_| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err("down")
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[test]
    fn test_policy_attempts() {
        assert_eq!(RetryPolicy::fixed(5, Duration::ZERO).max_attempts(), 6);
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }
}
