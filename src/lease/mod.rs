use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime},
};

use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};

use crate::{
    error::{LockError, LossReason},
    lock::AttemptState,
};

pub(crate) mod manager;
mod renewer;

pub use manager::LeaseManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    Releasing,
    Released,
    Lost(LossReason),
}

impl LeaseStatus {
    pub fn attempt_state(&self) -> AttemptState {
        match self {
            LeaseStatus::Held => AttemptState::Held,
            LeaseStatus::Releasing => AttemptState::Releasing,
            LeaseStatus::Released => AttemptState::Released,
            LeaseStatus::Lost(_) => AttemptState::Lost,
        }
    }
}

/// Bookkeeping shared by the renewal tick and the release path.
///
/// The tick holds the lock across its store call and gives it up as soon as
/// the lease leaves `Held`, so release only waits for the tick to notice.
pub(crate) struct RenewalBook {
    pub(crate) stopped: bool,
    pub(crate) last_renewed: Instant,
    pub(crate) consecutive_failures: u32,
}

/// A lease this process holds, as tracked by the [`LeaseManager`].
pub struct LeaseState {
    key: String,
    holder_id: String,
    acquired_at: Instant,
    acquired_at_wall: SystemTime,
    ttl: Duration,
    renewal_active: AtomicBool,
    pub(crate) book: Mutex<RenewalBook>,
    status: watch::Sender<LeaseStatus>,
    status_rx: watch::Receiver<LeaseStatus>,
}

impl LeaseState {
    pub(crate) fn new(key: &str, holder_id: &str, ttl: Duration) -> Self {
        let now = Instant::now();
        let (status, status_rx) = watch::channel(LeaseStatus::Held);
        Self {
            key: key.to_owned(),
            holder_id: holder_id.to_owned(),
            acquired_at: now,
            acquired_at_wall: SystemTime::now(),
            ttl,
            renewal_active: AtomicBool::new(true),
            book: Mutex::new(RenewalBook {
                stopped: false,
                last_renewed: now,
                consecutive_failures: 0,
            }),
            status,
            status_rx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn acquired_at(&self) -> SystemTime {
        self.acquired_at_wall
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the watchdog is still renewing this lease.
    pub fn renewal_active(&self) -> bool {
        self.renewal_active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LeaseStatus {
        self.status_rx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LeaseStatus> {
        self.status_rx.clone()
    }

    /// Resolves once the lease is releasing, released or lost.
    pub(crate) async fn left_held(&self) {
        let mut status = self.subscribe();
        loop {
            if *status.borrow_and_update() != LeaseStatus::Held {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn set_renewal_active(&self, active: bool) {
        self.renewal_active.store(active, Ordering::SeqCst);
    }

    /// `Held → Lost`. Ignored once the lease is releasing or already lost.
    pub(crate) fn mark_lost(&self, reason: LossReason) -> bool {
        self.transition(|status| match status {
            LeaseStatus::Held => Some(LeaseStatus::Lost(reason.clone())),
            _ => None,
        })
    }

    /// `Held | Lost → Releasing`; returns the status it left.
    pub(crate) fn mark_releasing(&self) -> LeaseStatus {
        let mut previous = LeaseStatus::Released;
        self.transition(|status| {
            previous = status.clone();
            match status {
                LeaseStatus::Held | LeaseStatus::Lost(_) => Some(LeaseStatus::Releasing),
                _ => None,
            }
        });
        previous
    }

    pub(crate) fn mark_released(&self) {
        self.transition(|_| Some(LeaseStatus::Released));
    }

    pub(crate) fn lost_error(&self, reason: LossReason) -> LockError {
        LockError::LeaseLost {
            key: self.key.clone(),
            holder_id: self.holder_id.clone(),
            reason,
        }
    }

    fn transition<F>(&self, next: F) -> bool
    where
        F: FnOnce(&LeaseStatus) -> Option<LeaseStatus>,
    {
        let mut changed = false;
        self.status.send_if_modified(|status| match next(status) {
            Some(updated) if updated != *status => {
                *status = updated;
                changed = true;
                true
            }
            _ => false,
        });
        changed
    }
}
