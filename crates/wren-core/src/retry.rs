//! Bounded retry with backoff for fallible remote calls.

use std::{future::Future, time::Duration};

use tokio::time::sleep;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    Linear,
    Exponential,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff,
        }
    }

    /// Delay to sleep after the given (1-based) failed attempt.
    fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.base_delay * attempt,
            Backoff::Exponential => self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000), Backoff::Exponential)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts.
///
/// Every error is retryable at this layer; classification lives with the
/// caller if it needs it. On exhaustion the last error is returned as-is,
/// never wrapped.
pub async fn execute<T, F, Fut>(policy: RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_observed(policy, op, |_, _| {}).await
}

/// Like [`execute`], with an observer invoked after every failed attempt.
/// The observer is diagnostic only; it cannot suppress the retry or the
/// eventual failure.
pub async fn execute_observed<T, F, Fut, O>(
    policy: RetryPolicy,
    mut op: F,
    mut on_error: O,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    O: FnMut(&Error, u32),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                on_error(&e, attempt);
                if attempt >= max_attempts {
                    return Err(e);
                }
                sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };
    use tokio::time::Instant;

    fn failing_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1000), Backoff::Exponential)
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_invokes_exactly_max_attempts_and_returns_original_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let start = Instant::now();

        let res: Result<()> = execute(failing_policy(), move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Remote("boom".to_string()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // ~1000ms then ~2000ms between the three attempts.
        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert!(start.elapsed() < Duration::from_millis(3500));
        match res {
            Err(Error::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected the original remote error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn linear_backoff_waits_base_times_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Backoff::Linear);
        let start = Instant::now();

        let _: Result<()> = execute(policy, || async {
            Err(Error::Remote("nope".to_string()))
        })
        .await;

        // 100ms after attempt 1, 200ms after attempt 2.
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let res = execute(failing_policy(), move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Remote("transient".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_every_failed_attempt_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let _: Result<()> = execute_observed(
            failing_policy(),
            || async { Err(Error::Remote("x".to_string())) },
            move |_, attempt| seen2.lock().unwrap().push(attempt),
        )
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
