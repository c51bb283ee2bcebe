//! Retry with exponential backoff for transient failures
//!
//! Only errors classified `Transient` are retried. Conflicts are handled by
//! the orchestrator itself since they need a re-fetch, not a replay.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::error::Classify;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, enable: bool) -> Self {
        self.jitter = enable;
        self
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if !self.jitter {
            return base;
        }
        let jitter_ms = (base.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
        (base + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// A cancelled backoff sleep returns the last error immediately.
    pub async fn execute<T, E, F, Fut>(&self, cancel: &CancelSignal, mut operation: F) -> Result<T, E>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind().is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    if !cancel.sleep(delay).await {
                        return Err(err);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(FailureKind);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Classify for Flaky {
        fn kind(&self) -> FailureKind {
            self.0
        }
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default()
            .with_jitter(false)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(60), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(2));
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::default();

        let result: Result<u32, Flaky> = policy
            .execute(&CancelSignal::new(), move || async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(Flaky(FailureKind::Transient)),
                    n => Ok(n),
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::default().with_max_retries(2);

        let result: Result<(), Flaky> = policy
            .execute(&CancelSignal::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(FailureKind::Transient))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), Flaky> = RetryPolicy::default()
            .execute(&CancelSignal::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(FailureKind::Tampered))
            })
            .await;

        assert!(matches!(result, Err(Flaky(FailureKind::Tampered))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let cancel = CancelSignal::new();
        cancel.cancel("stop");
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), Flaky> = RetryPolicy::default()
            .with_initial_delay(Duration::from_secs(3600))
            .execute(&cancel, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(FailureKind::Transient))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
