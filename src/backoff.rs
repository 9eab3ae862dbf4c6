//! Backoff schedules and the retry executor.
//!
//! A [`RetryPolicy`] bundles an attempt ceiling, a [`Backoff`] schedule and
//! a retryability predicate so each policy can be tested on its own.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Resets backoff to initial value.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// No delay.
    None,
    /// `attempt * step`.
    Linear { step: Duration },
    /// Doubling from `initial`, capped at `max`, optionally jittered.
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { step } => step * attempt,
            Backoff::Exponential {
                initial,
                max,
                jitter,
            } => {
                let mut schedule = ExponentialBackoff::new(initial, max);
                for _ in 1..attempt {
                    schedule.next();
                }
                let base = schedule.current();
                if jitter && !base.is_zero() {
                    // Up to +25%, still capped.
                    let spread = (base.as_millis() as u64 / 4).max(1);
                    let extra = rand::rng().random_range(0..=spread);
                    (base + Duration::from_millis(extra)).min(max)
                } else {
                    base
                }
            }
        }
    }
}

/// Attempt ceiling, delay schedule and retryability predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
    /// Decides whether an error is worth another attempt.
    pub retryable: fn(&Error) -> bool,
}

impl RetryPolicy {
    /// Policy retrying transient errors with linear backoff.
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear { step },
            retryable: Error::is_retryable,
        }
    }

    /// Policy retrying transient errors with capped, jittered exponential backoff.
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                max,
                jitter: true,
            },
            retryable: Error::is_retryable,
        }
    }

    /// Replaces the retryability predicate.
    pub fn with_retryable(mut self, retryable: fn(&Error) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Returns true if `err` after attempt `attempt` should be retried.
    pub fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retryable)(err)
    }
}

/// Runs `op` under `policy`, sleeping between retryable failures.
///
/// `op` receives the 1-based attempt number. The last error is returned
/// when attempts run out or a non-retryable error occurs.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(&err, attempt) => {
                let delay = policy.backoff.delay(attempt);
                tracing::warn!(
                    op = %label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(100), Duration::from_secs(300));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(200));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_secs(300));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(100));
    }

    #[test]
    fn linear_delay_scales_with_attempt() {
        let backoff = Backoff::Linear {
            step: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(1500));
    }

    #[test]
    fn exponential_delay_without_jitter_is_exact() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
    }

    #[test]
    fn exponential_jitter_stays_within_bounds() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(400),
            max: Duration::from_millis(1000),
            jitter: true,
        };
        for _ in 0..50 {
            let d = backoff.delay(2);
            assert!(d >= Duration::from_millis(800));
            assert!(d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn policy_stops_at_ceiling() {
        let policy = RetryPolicy::linear(3, Duration::ZERO);
        let err = Error::Timeout(Duration::from_secs(1));
        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        let result = retry(&policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::Provider("flaky".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(assert_ok!(result), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_short_circuits_non_retryable() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(5, Duration::from_secs(30));
        let started = std::time::Instant::now();
        let result: Result<(), Error> = retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ToolingMissing("gh".into())) }
        })
        .await;

        assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        let result: Result<(), Error> = retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Timeout(Duration::from_millis(1))) }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn custom_predicate_overrides_default() {
        let calls = AtomicU32::new(0);
        let policy =
            RetryPolicy::linear(4, Duration::from_millis(1)).with_retryable(|_| false);
        let _ = retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Provider("down".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
