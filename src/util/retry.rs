use std::{future::Future, time::Duration};

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};
use tracing::warn;

use crate::{config::BackoffConfig, error::StoreError};

use super::jittered;

/// Retries transient store failures with capped exponential backoff.
pub(crate) struct CappedBackoffStrategy {
    operation: &'static str,
    max_attempts: usize,
    backoff: BackoffConfig,
}

impl CappedBackoffStrategy {
    /// `retry_budget` counts retries, so the call runs at most `retry_budget + 1` times.
    pub(crate) fn new(operation: &'static str, retry_budget: u32, backoff: BackoffConfig) -> Self {
        Self {
            operation,
            max_attempts: retry_budget as usize + 1,
            backoff,
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        let attempt = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        jittered(self.backoff.delay_for(attempt))
    }
}

impl ErrorHandler<StoreError> for CappedBackoffStrategy {
    type OutError = StoreError;

    fn handle(&mut self, attempt: usize, e: StoreError) -> RetryPolicy<StoreError> {
        if attempt >= self.max_attempts || !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }

        let delay = self.delay(attempt);
        warn!(
            operation = self.operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "lease store call failed, retrying"
        );
        RetryPolicy::WaitRetry(delay)
    }
}

/// Runs one store call under [`CappedBackoffStrategy`].
pub(crate) async fn with_retry<T, F, Fut>(
    operation: &'static str,
    retry_budget: u32,
    backoff: &BackoffConfig,
    call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut + Unpin,
    Fut: Future<Output = Result<T, StoreError>>,
{
    FutureRetry::new(
        call,
        CappedBackoffStrategy::new(operation, retry_budget, backoff.clone()),
    )
    .await
    .map(|(value, _attempts)| value)
    .map_err(|(error, _attempts)| error)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(40), 2)
    }

    #[test]
    fn rejected_errors_are_forwarded_immediately() {
        let mut strategy = CappedBackoffStrategy::new("renew", 3, backoff());
        let policy = strategy.handle(1, StoreError::Rejected("no such table".to_owned()));
        assert!(matches!(policy, RetryPolicy::ForwardError(StoreError::Rejected(_))));
    }

    #[test]
    fn unavailable_errors_wait_within_the_cap() {
        let mut strategy = CappedBackoffStrategy::new("renew", 3, backoff());
        for attempt in 1..=3 {
            match strategy.handle(attempt, StoreError::Unavailable("down".to_owned())) {
                RetryPolicy::WaitRetry(delay) => assert!(delay <= Duration::from_millis(40)),
                _ => panic!("attempt {} should be retried", attempt),
            }
        }
        assert!(matches!(
            strategy.handle(4, StoreError::Unavailable("down".to_owned())),
            RetryPolicy::ForwardError(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_once_the_store_answers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = with_retry("try_acquire", 3, &backoff(), move || {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(StoreError::Unavailable("flaky".to_owned()))
                } else {
                    Ok(true)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<bool, _> = with_retry("release", 2, &backoff(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable("down".to_owned())) }
        })
        .await;

        assert_eq!(result, Err(StoreError::Unavailable("down".to_owned())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
