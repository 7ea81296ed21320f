//! The public lock contract.
//!
//! [`LockCoordinator`] ties the store, the wait queue and the lease manager
//! together. `lock` waits without bound, `try_lock` gives up after a wait
//! bound; both run the same acquisition loop.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{LockConfig, TimeUnit},
    error::{LockError, LockResult, LossReason, StoreError},
    lease::{LeaseManager, LeaseState, LeaseStatus},
    lock::{
        AttemptState, DistributedTask, LeaseView, LockDescriptor, LockHandle, LockMode,
        LockOptions, WaitBound,
    },
    queue::{wait_for_wakeup, TicketGuard, Turn, WaitQueue},
    store::LeaseStore,
    util::{jittered, retry::with_retry, Deadline},
};


pub(crate) struct Inner {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    lease_manager: LeaseManager,
    wait_queue: Arc<WaitQueue>,
}

impl Inner {
    async fn store_call<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Unpin,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_retry(
            operation,
            self.config.store_retry_budget,
            &self.config.store_backoff,
            call,
        )
        .await
    }

    async fn try_acquire(&self, descriptor: &LockDescriptor, ttl: Duration) -> Result<bool, StoreError> {
        self.store_call("try_acquire", || {
            self.store
                .try_acquire(descriptor.key(), descriptor.holder_id(), ttl)
        })
        .await
    }

    /// Failure of a store call while acquiring: transient outages that
    /// outlasted the retry budget end the attempt like a timeout would.
    fn acquisition_failed(
        &self,
        descriptor: &LockDescriptor,
        deadline: &Deadline,
        error: StoreError,
    ) -> LockError {
        warn!(
            key = %descriptor.key(),
            holder_id = %descriptor.holder_id(),
            error = %error,
            "lease store failed during acquisition"
        );
        if error.is_retryable() {
            LockError::AcquisitionTimeout {
                key: descriptor.key().to_owned(),
                waited: deadline.elapsed(),
            }
        } else {
            LockError::StoreUnavailable {
                key: descriptor.key().to_owned(),
                source: error,
            }
        }
    }

    fn timed_out(&self, descriptor: &LockDescriptor, deadline: &Deadline) -> LockError {
        debug!(
            key = %descriptor.key(),
            holder_id = %descriptor.holder_id(),
            state = %AttemptState::TimedOut,
            "lock attempt timed out"
        );
        LockError::AcquisitionTimeout {
            key: descriptor.key().to_owned(),
            waited: deadline.elapsed(),
        }
    }

    fn held(self: &Arc<Self>, descriptor: &LockDescriptor, mode: LockMode, ttl: Duration) -> LockHandle {
        let (lease_id, lease) = self
            .lease_manager
            .start(descriptor.key(), descriptor.holder_id(), ttl);
        LockHandle::new(self.clone(), lease_id, lease, mode)
    }

    /// Slack a store call gets past the deadline before the attempt gives up.
    fn quantum(&self) -> Duration {
        self.config.poll_interval
    }

    /// Runs one store call of an acquisition attempt.
    ///
    /// The call may run until one quantum past the deadline, or one lease
    /// TTL when the attempt waits forever; a call that is still pending then
    /// ends the attempt with [`LockError::AcquisitionTimeout`].
    async fn bounded<T, Fut>(
        &self,
        descriptor: &LockDescriptor,
        deadline: &Deadline,
        ttl: Duration,
        call: Fut,
    ) -> LockResult<T>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let budget = deadline.call_budget(self.quantum(), ttl);
        match tokio::time::timeout(budget, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(self.acquisition_failed(descriptor, deadline, error)),
            Err(_) => {
                warn!(
                    key = %descriptor.key(),
                    holder_id = %descriptor.holder_id(),
                    budget_ms = budget.as_millis() as u64,
                    "lease store did not answer during acquisition"
                );
                Err(self.timed_out(descriptor, deadline))
            }
        }
    }

    /// Dequeues within the attempt's budget. A ticket still queued after
    /// that is removed in the background when the guard drops.
    async fn leave_queue(&self, guard: &mut TicketGuard, deadline: &Deadline, ttl: Duration) {
        let budget = deadline.call_budget(self.quantum(), ttl);
        let _ = tokio::time::timeout(budget, guard.dequeue()).await;
    }

    async fn acquire_unfair(
        self: &Arc<Self>,
        descriptor: &LockDescriptor,
        ttl: Duration,
        deadline: &Deadline,
    ) -> LockResult<LockHandle> {
        let notify = self.wait_queue.notifier(descriptor.key());
        let mut watch = self.wait_queue.watch(descriptor.key());
        let mut attempt = 0u32;

        loop {
            let released = notify.notified();
            let acquired = self
                .bounded(descriptor, deadline, ttl, self.try_acquire(descriptor, ttl))
                .await?;
            if acquired {
                return Ok(self.held(descriptor, LockMode::Unfair, ttl));
            }

            if deadline.expired() {
                return Err(self.timed_out(descriptor, deadline));
            }

            let delay = deadline.clamp(jittered(self.config.acquire_backoff.delay_for(attempt)));
            attempt = attempt.saturating_add(1);
            wait_for_wakeup(released, &mut watch, delay).await;
        }
    }

    async fn acquire_fair(
        self: &Arc<Self>,
        descriptor: &LockDescriptor,
        ttl: Duration,
        deadline: &Deadline,
    ) -> LockResult<LockHandle> {
        let ticket = self
            .bounded(descriptor, deadline, ttl, self.wait_queue.enqueue(descriptor))
            .await?;
        let mut guard = TicketGuard::new(self.wait_queue.clone(), ticket);
        debug!(
            key = %descriptor.key(),
            holder_id = %descriptor.holder_id(),
            state = %AttemptState::Enqueued,
            "waiting for turn"
        );

        let notify = self.wait_queue.notifier(descriptor.key());
        let mut watch = self.wait_queue.watch(descriptor.key());

        loop {
            let released = notify.notified();
            let Some(ticket) = guard.ticket().cloned() else {
                return Err(self.timed_out(descriptor, deadline));
            };

            let turn = match self
                .bounded(descriptor, deadline, ttl, self.wait_queue.turn(&ticket))
                .await
            {
                Ok(turn) => turn,
                Err(error) => {
                    self.leave_queue(&mut guard, deadline, ttl).await;
                    return Err(error);
                }
            };

            match turn {
                Turn::First => {
                    match self
                        .bounded(descriptor, deadline, ttl, self.try_acquire(descriptor, ttl))
                        .await
                    {
                        Ok(true) => {
                            let handle = self.held(descriptor, LockMode::Fair, ttl);
                            self.leave_queue(&mut guard, deadline, ttl).await;
                            return Ok(handle);
                        }
                        Ok(false) => {}
                        Err(error) => {
                            self.leave_queue(&mut guard, deadline, ttl).await;
                            return Err(error);
                        }
                    }
                }
                Turn::Behind => {}
                Turn::Expired => {
                    warn!(
                        key = %descriptor.key(),
                        holder_id = %descriptor.holder_id(),
                        sequence = ticket.sequence,
                        "wait ticket expired, queueing again"
                    );
                    match self
                        .bounded(descriptor, deadline, ttl, self.wait_queue.enqueue(descriptor))
                        .await
                    {
                        Ok(fresh) => guard.replace(fresh),
                        Err(error) => {
                            self.leave_queue(&mut guard, deadline, ttl).await;
                            return Err(error);
                        }
                    }
                    continue;
                }
            }

            if deadline.expired() {
                self.leave_queue(&mut guard, deadline, ttl).await;
                return Err(self.timed_out(descriptor, deadline));
            }

            let delay = deadline.clamp(jittered(self.wait_queue.poll_interval()));
            wait_for_wakeup(released, &mut watch, delay).await;
        }
    }

    pub(crate) async fn release_lease(
        &self,
        lease_id: u64,
        lease: &LeaseState,
        mode: LockMode,
    ) -> LockResult<()> {
        let previous = self.lease_manager.stop(lease_id, lease).await;
        debug!(
            key = %lease.key(),
            holder_id = %lease.holder_id(),
            state = %AttemptState::Releasing,
            "releasing lock"
        );

        // Past one TTL the store has dropped the lease on its own.
        let release = self.store_call("release", || self.store.release(lease.key(), lease.holder_id()));
        let outcome = match tokio::time::timeout(lease.ttl(), release).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::Unavailable("release timed out".to_owned())),
        };
        lease.mark_released();
        self.wait_queue.notify_released(lease.key());

        match (previous, outcome) {
            (LeaseStatus::Lost(reason), _) => Err(lease.lost_error(reason)),
            (_, Ok(true)) => {
                info!(
                    key = %lease.key(),
                    holder_id = %lease.holder_id(),
                    mode = %mode,
                    held_ms = lease.held_for().as_millis() as u64,
                    "lock released"
                );
                Ok(())
            }
            (_, Ok(false)) => {
                warn!(
                    key = %lease.key(),
                    holder_id = %lease.holder_id(),
                    "lease was no longer owned at release"
                );
                Err(lease.lost_error(LossReason::Superseded))
            }
            (_, Err(error)) => Err(LockError::StoreUnavailable {
                key: lease.key().to_owned(),
                source: error,
            }),
        }
    }
}

/// Acquires and releases distributed locks against a [`LeaseStore`].
///
/// Cloning is cheap; clones share the same watchdogs and holder-id sequence.
#[derive(Clone)]
pub struct LockCoordinator {
    inner: Arc<Inner>,
    instance_id: Arc<str>,
    next_holder: Arc<AtomicU64>,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> LockResult<Self> {
        config.validate()?;
        let wait_queue = Arc::new(WaitQueue::new(store.clone(), &config));
        let lease_manager = LeaseManager::new(store.clone(), &config);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                lease_manager,
                wait_queue,
            }),
            instance_id: Uuid::new_v4().to_string().into(),
            next_holder: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Unique identity of this coordinator, the prefix of every holder id it mints.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Descriptor for `key` with a holder id no other acquisition shares.
    pub fn descriptor(&self, key: impl Into<String>) -> LockResult<LockDescriptor> {
        let sequence = self.next_holder.fetch_add(1, Ordering::SeqCst);
        LockDescriptor::new(key, format!("{}:{}", self.instance_id, sequence))
    }

    /// Options for `lock`: wait forever, default lease.
    pub fn lock_options(&self, fair: bool) -> LockOptions {
        LockOptions::new(
            LockMode::from(fair),
            WaitBound::Forever,
            self.inner.config.default_lease_ttl(),
        )
    }

    /// Options for `try_lock`: default wait bound and lease.
    pub fn try_lock_options(&self, fair: bool) -> LockOptions {
        LockOptions::new(
            LockMode::from(fair),
            WaitBound::Within(self.inner.config.default_try_timeout()),
            self.inner.config.default_lease_ttl(),
        )
    }

    /// `try_lock` options using the configured fairness.
    pub fn default_options(&self) -> LockOptions {
        self.try_lock_options(self.inner.config.fair)
    }

    /// Acquires `descriptor` and returns the handle; the caller releases it.
    pub async fn acquire(&self, descriptor: &LockDescriptor, options: &LockOptions) -> LockResult<LockHandle> {
        options.validate()?;
        let deadline = Deadline::new(options.wait.as_option());
        debug!(
            key = %descriptor.key(),
            holder_id = %descriptor.holder_id(),
            mode = %options.mode,
            state = %AttemptState::Acquiring,
            "acquiring lock"
        );

        let handle = match options.mode {
            LockMode::Unfair => {
                self.inner
                    .acquire_unfair(descriptor, options.lease_ttl, &deadline)
                    .await?
            }
            LockMode::Fair => {
                self.inner
                    .acquire_fair(descriptor, options.lease_ttl, &deadline)
                    .await?
            }
        };

        info!(
            key = %descriptor.key(),
            holder_id = %descriptor.holder_id(),
            mode = %options.mode,
            waited_ms = deadline.elapsed().as_millis() as u64,
            "lock acquired"
        );
        Ok(handle)
    }

    /// Runs `work` while holding `descriptor` and releases afterwards.
    ///
    /// If the lease is lost while `work` runs, `work` is dropped at its next
    /// suspension point and the call fails with [`LockError::LeaseLost`].
    /// Release happens on every path, including when this future is itself
    /// dropped or `work` panics.
    pub async fn run<T, F, Fut>(&self, descriptor: &LockDescriptor, options: &LockOptions, work: F) -> LockResult<T>
    where
        F: FnOnce(LeaseView) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(descriptor, options).await?;

        let outcome = {
            let lost = handle.lost();
            let work = work(handle.view());
            tokio::pin!(lost);
            tokio::pin!(work);
            tokio::select! {
                biased;
                error = &mut lost => Err(error),
                value = &mut work => Ok(value),
            }
        };

        let released = handle.release().await;
        match (outcome, released) {
            (Err(error), _) => Err(error),
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error),
        }
    }

    async fn run_task<T: DistributedTask>(&self, task: T, options: LockOptions) -> LockResult<T::Output> {
        let descriptor = self.descriptor(task.lock_name())?;
        self.run(&descriptor, &options, move |_| task.process()).await
    }

    /// Waits without bound, default lease.
    pub async fn lock<T: DistributedTask>(&self, task: T, fair: bool) -> LockResult<T::Output> {
        let options = self.lock_options(fair);
        self.run_task(task, options).await
    }

    /// Waits without bound with a lease of `lease_time` `unit`s.
    pub async fn lock_for<T: DistributedTask>(
        &self,
        task: T,
        lease_time: u64,
        unit: TimeUnit,
        fair: bool,
    ) -> LockResult<T::Output> {
        let options = LockOptions::new(
            LockMode::from(fair),
            WaitBound::Forever,
            unit.to_duration(lease_time),
        );
        self.run_task(task, options).await
    }

    /// Waits up to the default bound, default lease.
    pub async fn try_lock<T: DistributedTask>(&self, task: T, fair: bool) -> LockResult<T::Output> {
        let options = self.try_lock_options(fair);
        self.run_task(task, options).await
    }

    /// Waits up to `try_time` `unit`s with a lease of `lease_time` `unit`s.
    pub async fn try_lock_for<T: DistributedTask>(
        &self,
        task: T,
        try_time: u64,
        lease_time: u64,
        unit: TimeUnit,
        fair: bool,
    ) -> LockResult<T::Output> {
        let options = LockOptions::new(
            LockMode::from(fair),
            WaitBound::Within(unit.to_duration(try_time)),
            unit.to_duration(lease_time),
        );
        self.run_task(task, options).await
    }

    pub fn active_leases(&self) -> usize {
        self.inner.lease_manager.active_leases()
    }

    /// Stops all renewal. Leases still held expire after their TTL.
    pub async fn shutdown(&self) {
        self.inner.lease_manager.shutdown().await;
    }
}
