//! Bounded retry with optional exponential backoff.

use std::future::Future;
use std::time::Duration;

/// Where a retry loop currently is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    /// 1-based attempt number about to run.
    pub attempt: u32,
    /// Delay that will be slept if this attempt fails.
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

/// All attempts failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_factor: backoff_factor.max(1.0),
        }
    }

    /// Same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, 1.0)
    }

    pub fn first(&self) -> RetryState {
        RetryState {
            attempt: 1,
            delay: self.initial_delay,
        }
    }

    /// The state after `state` failed, or `None` when attempts are used up.
    pub fn next(&self, state: RetryState) -> Option<RetryState> {
        if state.attempt >= self.max_attempts {
            return None;
        }
        Some(RetryState {
            attempt: state.attempt + 1,
            delay: Duration::try_from_secs_f64(state.delay.as_secs_f64() * self.backoff_factor)
                .unwrap_or(Duration::MAX),
        })
    }

    /// Run `operation` until it succeeds, fails with a non-retriable error, or
    /// runs out of attempts. Sleeps `state.delay` between attempts.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
        retriable: impl Fn(&E) -> bool,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut state = self.first();
        loop {
            match operation(state).await {
                Ok(value) => {
                    if state.attempt > 1 {
                        tracing::debug!(label, attempt = state.attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let next = if retriable(&error) { self.next(state) } else { None };
                    let Some(next) = next else {
                        return Err(Exhausted {
                            attempts: state.attempt,
                            error,
                        });
                    };
                    tracing::warn!(
                        label,
                        attempt = state.attempt,
                        max_attempts = self.max_attempts,
                        delay_secs = state.delay.as_secs_f64(),
                        %error,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(state.delay).await;
                    state = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_by_the_backoff_factor() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(2), 2.0);
        let first = policy.first();
        let second = policy.next(first).expect("second attempt");
        let third = policy.next(second).expect("third attempt");
        assert_eq!(second.delay, Duration::from_secs(4));
        assert_eq!(third.delay, Duration::from_secs(8));
        assert_eq!(third.attempt, 3);
        assert!(policy.next(third).is_none());
    }

    #[test]
    fn growing_delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::exponential(u32::MAX, Duration::from_secs(3600), 1e300);
        let second = policy.next(policy.first()).expect("second attempt");
        let third = policy.next(second).expect("third attempt");
        assert_eq!(third.delay, Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retriable_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        let result: Result<(), _> = policy
            .run(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("fatal") }
                },
                |error| *error != "fatal",
            )
            .await;

        let exhausted = result.expect_err("fails");
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let value = policy
            .run(
                "test",
                |state| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if state.attempt < 3 {
                            Err("timeout")
                        } else {
                            Ok(state.attempt)
                        }
                    }
                },
                |_| true,
            )
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
