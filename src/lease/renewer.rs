use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::LossReason,
    store::LeaseStore,
    util::runnable::{Next, PeriodicRunnable},
};

use super::LeaseState;

const MIN_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Watchdog for one held lease.
pub(crate) struct LeaseRenewer {
    lease: Arc<LeaseState>,
    store: Arc<dyn LeaseStore>,
    interval: Duration,
    retry_delay: Duration,
    retry_budget: u32,
}

impl LeaseRenewer {
    /// Renews every `ttl / 3` (never below `min_interval`). Failed renewals are
    /// retried `retry_budget` times, spaced so the last retry still lands
    /// inside the TTL.
    pub(crate) fn new(
        lease: Arc<LeaseState>,
        store: Arc<dyn LeaseStore>,
        min_interval: Duration,
        retry_budget: u32,
    ) -> Self {
        let interval = (lease.ttl() / 3).max(min_interval);
        let retry_delay = (interval / retry_budget.max(1)).max(MIN_RETRY_DELAY);
        Self {
            lease,
            store,
            interval,
            retry_delay,
            retry_budget,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    fn lose(&self, reason: LossReason) -> Next {
        if self.lease.mark_lost(reason.clone()) {
            warn!(
                key = %self.lease.key(),
                holder_id = %self.lease.holder_id(),
                reason = %reason,
                "lease lost"
            );
        }
        Next::Stop
    }
}

#[async_trait]
impl PeriodicRunnable for LeaseRenewer {
    async fn run_once(&self) -> Next {
        let mut book = self.lease.book.lock().await;
        if book.stopped {
            return Next::Stop;
        }

        let started = Instant::now();
        let budget = self
            .lease
            .ttl()
            .saturating_sub(started.duration_since(book.last_renewed));
        if budget.is_zero() {
            book.stopped = true;
            return self.lose(LossReason::Expired);
        }

        // Past the TTL the store has let the lease go; a later answer means nothing.
        let renewal = tokio::time::timeout(
            budget,
            self.store
                .renew(self.lease.key(), self.lease.holder_id(), self.lease.ttl()),
        );
        let outcome = tokio::select! {
            biased;
            _ = self.lease.left_held() => {
                book.stopped = true;
                return Next::Stop;
            }
            outcome = renewal => outcome,
        };

        let Ok(outcome) = outcome else {
            book.stopped = true;
            return self.lose(LossReason::Expired);
        };

        match outcome {
            Ok(true) => {
                book.last_renewed = started;
                book.consecutive_failures = 0;
                debug!(
                    key = %self.lease.key(),
                    holder_id = %self.lease.holder_id(),
                    "lease renewed"
                );
                Next::After(self.interval)
            }
            Ok(false) => {
                book.stopped = true;
                self.lose(LossReason::Superseded)
            }
            Err(error) => {
                book.consecutive_failures += 1;
                let attempts = book.consecutive_failures;
                if attempts >= self.retry_budget || !error.is_retryable() {
                    book.stopped = true;
                    return self.lose(LossReason::RenewalFailed {
                        attempts,
                        last_error: error.to_string(),
                    });
                }

                warn!(
                    key = %self.lease.key(),
                    holder_id = %self.lease.holder_id(),
                    attempt = attempts,
                    error = %error,
                    "lease renewal failed, retrying"
                );
                Next::After(self.retry_delay)
            }
        }
    }

    async fn before_shutdown_complete(&self) {
        self.lease.set_renewal_active(false);
    }
}

#[cfg(test)]
mod tests {
    use crate::{lease::LeaseStatus, store::InMemoryLeaseStore};

    use super::*;

    const TTL: Duration = Duration::from_millis(300);

    async fn held(store: &InMemoryLeaseStore) -> Arc<LeaseState> {
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());
        Arc::new(LeaseState::new("orders", "a", TTL))
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_interval_is_a_third_of_ttl_with_a_floor() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;

        let renewer = LeaseRenewer::new(lease.clone(), store.clone(), Duration::from_millis(10), 3);
        assert_eq!(renewer.interval(), Duration::from_millis(100));

        let floored = LeaseRenewer::new(lease, store, Duration::from_millis(150), 3);
        assert_eq!(floored.interval(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_renewal_keeps_going() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;
        let renewer = LeaseRenewer::new(lease.clone(), store.clone(), Duration::from_millis(10), 3);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(renewer.run_once().await, Next::After(Duration::from_millis(100)));
        assert_eq!(store.renewals(), 1);
        assert_eq!(lease.status(), LeaseStatus::Held);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_lease_is_lost_immediately() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;
        store.expire("orders");
        assert!(store.try_acquire("orders", "b", TTL).await.unwrap());

        let renewer = LeaseRenewer::new(lease.clone(), store.clone(), Duration::from_millis(10), 3);
        assert_eq!(renewer.run_once().await, Next::Stop);
        assert_eq!(lease.status(), LeaseStatus::Lost(LossReason::Superseded));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_past_budget_lose_the_lease() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;
        let renewer = LeaseRenewer::new(lease.clone(), store.clone(), Duration::from_millis(10), 3);
        store.set_reachable(false);

        assert_eq!(renewer.run_once().await, Next::After(Duration::from_millis(100) / 3));
        assert_eq!(renewer.run_once().await, Next::After(Duration::from_millis(100) / 3));
        assert_eq!(renewer.run_once().await, Next::Stop);
        assert!(matches!(
            lease.status(),
            LeaseStatus::Lost(LossReason::RenewalFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lease_is_lost_without_calling_the_store() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;
        let renewer = LeaseRenewer::new(lease.clone(), store.clone(), Duration::from_millis(10), 3);

        tokio::time::advance(TTL).await;
        assert_eq!(renewer.run_once().await, Next::Stop);
        assert_eq!(lease.status(), LeaseStatus::Lost(LossReason::Expired));
        assert_eq!(store.renewals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_lease_is_never_renewed() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;
        let renewer = LeaseRenewer::new(lease.clone(), store.clone(), Duration::from_millis(10), 3);

        lease.book.lock().await.stopped = true;
        assert_eq!(renewer.run_once().await, Next::Stop);
        assert_eq!(store.renewals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_renewal_loses_the_lease_when_the_ttl_runs_out() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;
        let renewer = LeaseRenewer::new(lease.clone(), store.clone(), Duration::from_millis(10), 3);
        let acquired = Instant::now();

        store.stall_renewals(true);
        tokio::time::advance(Duration::from_millis(100)).await;

        assert_eq!(renewer.run_once().await, Next::Stop);
        assert!(acquired.elapsed() >= TTL);
        assert!(acquired.elapsed() < TTL + Duration::from_millis(5));
        assert_eq!(lease.status(), LeaseStatus::Lost(LossReason::Expired));
        assert_eq!(store.renewals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_interrupts_a_hung_renewal() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = held(&store).await;
        let renewer = Arc::new(LeaseRenewer::new(
            lease.clone(),
            store.clone(),
            Duration::from_millis(10),
            3,
        ));
        store.stall_renewals(true);

        let tick = {
            let renewer = renewer.clone();
            tokio::spawn(async move { renewer.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tick.is_finished());

        let started = Instant::now();
        assert_eq!(lease.mark_releasing(), LeaseStatus::Held);
        assert!(lease.book.lock().await.stopped);
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(tick.await.unwrap(), Next::Stop);
        assert_eq!(lease.status(), LeaseStatus::Releasing);
    }
}
