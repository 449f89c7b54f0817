//! Retry-with-interval combinator used by every polling loop
//!
//! A probe is called until it yields a value or the deadline passes. Probes
//! failing with a retryable error are retried with exponential backoff up to
//! a bounded number of consecutive attempts; any other error aborts at once.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::config::PollingSettings;
use crate::error::HarnessError;

/// Cadence and limits for one polling loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub deadline: Duration,
    pub max_transient_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline,
            max_transient_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }

    pub fn from_settings(settings: &PollingSettings, deadline: Duration) -> Self {
        Self {
            interval: settings.interval(),
            deadline,
            max_transient_retries: settings.max_transient_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_retries(mut self, retries: u32, base: Duration, max: Duration) -> Self {
        self.max_transient_retries = retries;
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Why a polling loop stopped without a value
#[derive(Debug)]
pub enum PollError {
    /// The deadline passed; callers map this to their own timeout kind
    Elapsed { elapsed: Duration, polls: u32 },
    /// The probe failed fatally, or transient failures exceeded the budget
    Aborted(HarnessError),
}

impl PollError {
    /// Convert into a harness error, choosing the timeout kind for `Elapsed`
    pub fn into_error(self, on_elapsed: impl FnOnce(Duration) -> HarnessError) -> HarnessError {
        match self {
            PollError::Elapsed { elapsed, .. } => on_elapsed(elapsed),
            PollError::Aborted(err) => err,
        }
    }
}

/// Call `probe` at `schedule.interval` until it returns `Some`
pub async fn poll_until<T, F, Fut>(schedule: &PollSchedule, mut probe: F) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, HarnessError>>,
{
    let started = Instant::now();
    let mut polls = 0u32;
    let mut transient_failures = 0u32;

    loop {
        polls += 1;
        let pause = match probe().await {
            Ok(Some(value)) => {
                debug!("Poll satisfied after {} attempts in {:?}", polls, started.elapsed());
                return Ok(value);
            }
            Ok(None) => {
                transient_failures = 0;
                schedule.interval
            }
            Err(err) if err.is_retryable() => {
                transient_failures += 1;
                if transient_failures > schedule.max_transient_retries {
                    warn!(
                        "Giving up after {} consecutive transient failures: {}",
                        transient_failures, err
                    );
                    return Err(PollError::Aborted(err));
                }
                let delay = schedule.backoff(transient_failures);
                warn!(
                    "Transient poll failure ({}/{}), retrying in {:?}: {}",
                    transient_failures, schedule.max_transient_retries, delay, err
                );
                delay
            }
            Err(err) => return Err(PollError::Aborted(err)),
        };

        let elapsed = started.elapsed();
        if elapsed >= schedule.deadline {
            return Err(PollError::Elapsed { elapsed, polls });
        }

        time::sleep(pause.min(schedule.deadline - elapsed)).await;
    }
}

/// Run a single read, retrying only transient failures with backoff
pub async fn retry_transient<T, F, Fut>(schedule: &PollSchedule, mut call: F) -> Result<T, HarnessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HarnessError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < schedule.max_transient_retries => {
                attempt += 1;
                let delay = schedule.backoff(attempt);
                warn!("Transient failure (attempt {}), retrying in {:?}: {}", attempt, delay, err);
                time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_schedule(deadline: Duration) -> PollSchedule {
        PollSchedule::new(Duration::from_secs(1), deadline).with_retries(
            2,
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let schedule = PollSchedule::new(Duration::from_secs(1), Duration::from_secs(60)).with_retries(
            10,
            Duration::from_millis(500),
            Duration::from_secs(8),
        );
        assert_eq!(schedule.backoff(1), Duration::from_millis(500));
        assert_eq!(schedule.backoff(2), Duration::from_secs(1));
        assert_eq!(schedule.backoff(4), Duration::from_secs(4));
        assert_eq!(schedule.backoff(10), Duration::from_secs(8));
        assert_eq!(schedule.backoff(40), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_first_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = poll_until(&fast_schedule(Duration::from_secs(60)), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n == 3 { Some(n) } else { None })
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_elapses_at_deadline() {
        let result: Result<(), PollError> =
            poll_until(&fast_schedule(Duration::from_secs(5)), || async { Ok(None) }).await;
        match result {
            Err(PollError::Elapsed { elapsed, polls }) => {
                assert!(elapsed >= Duration::from_secs(5));
                assert_eq!(polls, 6);
            }
            other => panic!("expected elapsed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_then_escalated() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), PollError> = poll_until(&fast_schedule(Duration::from_secs(60)), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HarnessError::transient("connection refused"))
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(PollError::Aborted(HarnessError::TransientPoll { .. }))
        ));
        // initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), PollError> = poll_until(&fast_schedule(Duration::from_secs(60)), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HarnessError::protocol("missing state"))
            }
        })
        .await;
        assert!(matches!(result, Err(PollError::Aborted(HarnessError::Protocol { .. }))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = retry_transient(&fast_schedule(Duration::from_secs(60)), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HarnessError::transient("reset"))
                } else {
                    Ok(100i64)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 100);
    }
}
