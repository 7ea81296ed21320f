use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::debug;

use super::{renewer::LeaseRenewer, LeaseState, LeaseStatus};
use crate::{config::LockConfig, store::LeaseStore, util::runnable::run_with_delay};

struct Watchdog {
    lease: Arc<LeaseState>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Runs one renewal watchdog per held lease.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    min_renewal_interval: Duration,
    renewal_retry_budget: u32,
    watchdogs: Mutex<HashMap<u64, Watchdog>>,
    next_id: AtomicU64,
}

impl LeaseManager {
    pub(crate) fn new(store: Arc<dyn LeaseStore>, config: &LockConfig) -> Self {
        Self {
            store,
            min_renewal_interval: config.min_renewal_interval,
            renewal_retry_budget: config.renewal_retry_budget,
            watchdogs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Starts renewing a lease the store just granted.
    pub(crate) fn start(&self, key: &str, holder_id: &str, ttl: Duration) -> (u64, Arc<LeaseState>) {
        let lease = Arc::new(LeaseState::new(key, holder_id, ttl));
        let renewer = Arc::new(LeaseRenewer::new(
            lease.clone(),
            self.store.clone(),
            self.min_renewal_interval,
            self.renewal_retry_budget,
        ));
        let shutdown = Arc::new(Notify::new());
        let first_delay = renewer.interval();
        let task = tokio::spawn(run_with_delay(renewer, first_delay, shutdown.clone()));

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            key,
            holder_id,
            ttl_ms = ttl.as_millis() as u64,
            renew_every_ms = first_delay.as_millis() as u64,
            "started lease watchdog"
        );
        self.watchdogs().insert(
            id,
            Watchdog {
                lease: lease.clone(),
                shutdown,
                task,
            },
        );
        (id, lease)
    }

    /// Stops renewing `lease` and returns the status it had before release began.
    ///
    /// An in-flight renewal is abandoned rather than awaited; once this
    /// returns no further renewal will reach the store.
    pub(crate) async fn stop(&self, id: u64, lease: &LeaseState) -> LeaseStatus {
        let previous = lease.mark_releasing();
        lease.book.lock().await.stopped = true;
        lease.set_renewal_active(false);

        if let Some(watchdog) = self.watchdogs().remove(&id) {
            watchdog.shutdown.notify_one();
        }
        debug!(
            key = %lease.key(),
            holder_id = %lease.holder_id(),
            "stopped lease watchdog"
        );
        previous
    }

    /// Leases whose watchdog is still running.
    pub fn active_leases(&self) -> usize {
        let mut watchdogs = self.watchdogs();
        watchdogs.retain(|_, watchdog| !watchdog.task.is_finished());
        watchdogs.len()
    }

    /// Stops every watchdog. Leases still held will expire in the store.
    pub async fn shutdown(&self) {
        let watchdogs: Vec<Watchdog> = self.watchdogs().drain().map(|(_, w)| w).collect();
        for watchdog in watchdogs {
            watchdog.task.abort();
            let _ = watchdog.task.await;
            watchdog.lease.book.lock().await.stopped = true;
            watchdog.lease.set_renewal_active(false);
        }
    }

    fn watchdogs(&self) -> MutexGuard<'_, HashMap<u64, Watchdog>> {
        self.watchdogs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
