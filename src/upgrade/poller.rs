//! Backoff Poller
//!
//! Bounded polling of a condition with exponentially growing, jittered
//! sleeps. Built on the `backoff` crate, with a clock that follows tokio
//! time so deadlines hold under a paused test runtime, and a policy wrapper
//! that shortens the last sleep so the final check lands on the deadline.

use super::config::BackoffConfig;
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use backoff::Clock;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of a single condition check
#[derive(Debug)]
pub enum Probe<T> {
    /// Condition met, stop polling
    Ready(T),
    /// Not there yet, try again after the next interval
    Pending(String),
    /// Non-retryable failure, stop polling and propagate
    Fatal(Error),
}

/// What is being waited for, used in log events and timeout errors
#[derive(Debug, Clone)]
pub struct WaitTarget {
    /// Resource description, e.g. "PVC ns/pvc1"
    pub resource: String,
    /// Condition description, e.g. "Lost"
    pub condition: String,
}

impl WaitTarget {
    pub fn new(resource: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            condition: condition.into(),
        }
    }
}

/// Clock backed by tokio's (possibly paused) time source
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

impl BackoffConfig {
    /// Build a fresh, unbounded backoff policy
    pub fn policy(&self) -> ExponentialBackoff<TokioClock> {
        let clock = TokioClock;
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            start_time: clock.now(),
            max_elapsed_time: None,
            clock,
        }
    }
}

/// Backoff policy that ends at a fixed deadline.
///
/// Intervals are clamped to the time left, so the last check runs at the
/// deadline instead of one full interval before it.
#[derive(Debug)]
pub struct DeadlineBackoff<B> {
    inner: B,
    deadline: tokio::time::Instant,
    exhausted: bool,
}

impl<B: Backoff> DeadlineBackoff<B> {
    pub fn new(inner: B, max_elapsed: Duration) -> Self {
        Self {
            inner,
            deadline: tokio::time::Instant::now() + max_elapsed,
            exhausted: false,
        }
    }
}

impl<B: Backoff> Backoff for DeadlineBackoff<B> {
    fn reset(&mut self) {
        self.inner.reset();
        self.exhausted = false;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.exhausted {
            return None;
        }

        let remaining = self
            .deadline
            .saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }

        let interval = self.inner.next_backoff()?;
        if interval >= remaining {
            self.exhausted = true;
            return Some(remaining);
        }
        Some(interval)
    }
}

/// Why a retry loop stopped without success
enum Halt {
    Pending(String),
    Fatal(Error),
}

/// Poll `probe` until it is ready, fails fatally, or `max_elapsed` passes.
///
/// The first check runs immediately and the last one at the deadline. A
/// timeout surfaces as [`Error::WaitTimeout`] naming the target and the
/// seconds actually spent polling.
pub async fn poll_until<T, F, Fut>(
    config: &BackoffConfig,
    max_elapsed: Duration,
    target: &WaitTarget,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<T>>,
{
    let started = tokio::time::Instant::now();
    let policy = DeadlineBackoff::new(config.policy(), max_elapsed);

    let operation = || {
        let check = probe();
        async move {
            match check.await {
                Probe::Ready(value) => Ok(value),
                Probe::Pending(reason) => Err(backoff::Error::transient(Halt::Pending(reason))),
                Probe::Fatal(err) => Err(backoff::Error::permanent(Halt::Fatal(err))),
            }
        }
    };

    let notify = |halt: Halt, increment: Duration| {
        if let Halt::Pending(reason) = halt {
            debug!(
                resource = %target.resource,
                condition = %target.condition,
                increment = ?increment,
                reason = %reason,
                "Not yet {}, waiting.",
                target.condition
            );
        }
    };

    match backoff::future::retry_notify(policy, operation, notify).await {
        Ok(value) => Ok(value),
        Err(Halt::Fatal(err)) => Err(err),
        Err(Halt::Pending(_)) => Err(Error::WaitTimeout {
            resource: target.resource.clone(),
            condition: target.condition.clone(),
            seconds: started.elapsed().as_secs_f64(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn target() -> WaitTarget {
        WaitTarget::new("PV pv1", "deleted")
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_retries() {
        let attempts = AtomicU32::new(0);

        let value = poll_until(
            &BackoffConfig::default(),
            Duration::from_secs(30),
            &target(),
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Probe::Pending(format!("attempt {}", n))
                } else {
                    Probe::Ready(n)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_immediately() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = poll_until(
            &BackoffConfig::default(),
            Duration::from_secs(30),
            &target(),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Probe::Fatal(Error::Internal("cache corrupted".into()))
            },
        )
        .await;

        assert_matches!(result, Err(Error::Internal(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_deadline() {
        let started = tokio::time::Instant::now();

        let result: Result<()> = poll_until(
            &BackoffConfig::default(),
            Duration::from_secs(10),
            &target(),
            || async { Probe::Pending("still there".into()) },
        )
        .await;

        let err = result.unwrap_err();
        assert_matches!(
            err,
            Error::WaitTimeout { seconds, .. } if (10.0..10.1).contains(&seconds)
        );
        assert_eq!(err.to_string(), "PV pv1 was not deleted after 10.00 seconds");
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_check_runs_at_deadline() {
        for deadline in [10, 30, 60] {
            let deadline = Duration::from_secs(deadline);
            let started = tokio::time::Instant::now();
            let last_check = parking_lot::Mutex::new(Duration::ZERO);

            let result: Result<()> = poll_until(
                &BackoffConfig::default(),
                deadline,
                &target(),
                || async {
                    *last_check.lock() = started.elapsed();
                    Probe::Pending("still there".into())
                },
            )
            .await;

            assert_matches!(result, Err(Error::WaitTimeout { .. }));
            let last_check = *last_check.lock();
            assert!(last_check >= deadline, "last check at {:?}", last_check);
            assert!(last_check < deadline + Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_at_deadline_succeeds() {
        let started = tokio::time::Instant::now();

        let value = poll_until(
            &BackoffConfig::default(),
            Duration::from_secs(10),
            &target(),
            || async {
                if started.elapsed() >= Duration::from_secs(10) {
                    Probe::Ready("gone")
                } else {
                    Probe::Pending("still there".into())
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "gone");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_clamps_intervals() {
        let mut policy =
            DeadlineBackoff::new(BackoffConfig::default().policy(), Duration::from_secs(2));

        let mut total = Duration::ZERO;
        while let Some(interval) = policy.next_backoff() {
            total += interval;
            tokio::time::advance(interval).await;
        }

        assert_eq!(total, Duration::from_secs(2));
        assert!(policy.next_backoff().is_none());
    }

    #[tokio::test]
    async fn test_policy_intervals_are_bounded() {
        let config = BackoffConfig::default();
        let mut policy = config.policy();

        for _ in 0..20 {
            let interval = policy.next_backoff().unwrap();
            // max interval plus full jitter
            assert!(interval <= Duration::from_millis(5500));
            assert!(interval >= Duration::from_millis(900));
        }
    }
}
