use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use tracing::warn;

use crate::{
    coordinator::Inner,
    error::{LockError, LockResult},
    lease::{LeaseState, LeaseStatus},
};

use super::{AttemptState, LockMode};

/// Read-only view of a held lease, cheap to clone into the critical section.
#[derive(Clone)]
pub struct LeaseView {
    lease: Arc<LeaseState>,
}

impl LeaseView {
    pub fn key(&self) -> &str {
        self.lease.key()
    }

    pub fn holder_id(&self) -> &str {
        self.lease.holder_id()
    }

    pub fn status(&self) -> LeaseStatus {
        self.lease.status()
    }

    pub fn is_held(&self) -> bool {
        self.lease.status() == LeaseStatus::Held
    }

    /// Fencing check to run before any side effect that needs exclusivity.
    pub fn ensure_held(&self) -> LockResult<()> {
        match self.lease.status() {
            LeaseStatus::Held => Ok(()),
            LeaseStatus::Lost(reason) => Err(self.lease.lost_error(reason)),
            LeaseStatus::Releasing | LeaseStatus::Released => Err(LockError::NotHeld {
                key: self.key().to_owned(),
                holder_id: self.holder_id().to_owned(),
            }),
        }
    }

    /// Resolves with [`LockError::LeaseLost`] once the lease is lost. Never
    /// resolves for a lease that is released normally.
    pub async fn lost(&self) -> LockError {
        let mut status = self.lease.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            if let LeaseStatus::Lost(reason) = current {
                return self.lease.lost_error(reason);
            }
            if status.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// A lock this process holds.
///
/// Release it with [`LockHandle::release`]. A handle dropped while still held
/// is released in the background.
pub struct LockHandle {
    inner: Arc<Inner>,
    lease_id: u64,
    view: LeaseView,
    mode: LockMode,
    released: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(inner: Arc<Inner>, lease_id: u64, lease: Arc<LeaseState>, mode: LockMode) -> Self {
        Self {
            inner,
            lease_id,
            view: LeaseView { lease },
            mode,
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        self.view.key()
    }

    pub fn holder_id(&self) -> &str {
        self.view.holder_id()
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn acquired_at(&self) -> SystemTime {
        self.view.lease.acquired_at()
    }

    pub fn held_for(&self) -> Duration {
        self.view.lease.held_for()
    }

    pub fn ttl(&self) -> Duration {
        self.view.lease.ttl()
    }

    pub fn lease(&self) -> &LeaseState {
        &self.view.lease
    }

    pub fn state(&self) -> AttemptState {
        self.view.status().attempt_state()
    }

    pub fn is_lost(&self) -> bool {
        matches!(self.view.status(), LeaseStatus::Lost(_))
    }

    pub fn view(&self) -> LeaseView {
        self.view.clone()
    }

    pub fn ensure_held(&self) -> LockResult<()> {
        self.view.ensure_held()
    }

    pub async fn lost(&self) -> LockError {
        self.view.lost().await
    }

    /// Stops renewal and hands the key back to the store.
    ///
    /// Fails with [`LockError::DoubleRelease`] on a second call and with
    /// [`LockError::LeaseLost`] when the lease was no longer ours by the time
    /// we let go of it.
    pub async fn release(&self) -> LockResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(LockError::DoubleRelease {
                key: self.key().to_owned(),
                holder_id: self.holder_id().to_owned(),
            });
        }

        self.inner
            .release_lease(self.lease_id, &self.view.lease, self.mode)
            .await
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key())
            .field("holder_id", &self.holder_id())
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let lease = self.view.lease.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    key = %lease.key(),
                    holder_id = %lease.holder_id(),
                    "lock handle dropped while held, releasing in background"
                );
                let inner = self.inner.clone();
                let lease_id = self.lease_id;
                let mode = self.mode;
                runtime.spawn(async move {
                    if let Err(error) = inner.release_lease(lease_id, &lease, mode).await {
                        warn!(
                            key = %lease.key(),
                            holder_id = %lease.holder_id(),
                            error = %error,
                            "background release failed"
                        );
                    }
                });
            }
            Err(_) => warn!(
                key = %lease.key(),
                holder_id = %lease.holder_id(),
                "lock handle dropped outside a runtime, lease will expire on its own"
            ),
        }
    }
}
