//! FIFO ordering of fair-mode waiters.
//!
//! The store hands out sequence numbers and remembers the queue, so ordering
//! holds across processes. This module adds the local side: keeping tickets
//! alive, answering "is it my turn", and waking waiters in this process as
//! soon as a lock they care about is released.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use futures::StreamExt;
use tokio::sync::{futures::Notified, Notify};
use tracing::{debug, warn};

use crate::{
    config::{BackoffConfig, LockConfig},
    error::StoreError,
    lock::LockDescriptor,
    store::{LeaseStore, WatchStream},
    util::retry::with_retry,
};

/// A waiter's place in the fairness queue of one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitTicket {
    pub key: String,
    pub holder_id: String,
    pub enqueued_at: SystemTime,
    /// Strictly increasing per key; lower goes first.
    pub sequence: u64,
}

/// Where a ticket currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Turn {
    First,
    Behind,
    /// The ticket aged out; the waiter has to queue again.
    Expired,
}

pub(crate) struct WaitQueue {
    store: Arc<dyn LeaseStore>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
    poll_interval: Duration,
    ticket_ttl: Duration,
    retry_budget: u32,
    backoff: BackoffConfig,
}

impl WaitQueue {
    pub(crate) fn new(store: Arc<dyn LeaseStore>, config: &LockConfig) -> Self {
        Self {
            store,
            notifiers: Mutex::new(HashMap::new()),
            poll_interval: config.poll_interval,
            ticket_ttl: config.ticket_ttl,
            retry_budget: config.store_retry_budget,
            backoff: config.store_backoff.clone(),
        }
    }

    pub(crate) async fn enqueue(&self, descriptor: &LockDescriptor) -> Result<WaitTicket, StoreError> {
        let ticket = with_retry("enqueue", self.retry_budget, &self.backoff, || {
            self.store
                .enqueue(descriptor.key(), descriptor.holder_id(), self.ticket_ttl)
        })
        .await?;

        debug!(
            key = %ticket.key,
            holder_id = %ticket.holder_id,
            sequence = ticket.sequence,
            "enqueued wait ticket"
        );
        Ok(ticket)
    }

    /// Refreshes `ticket` and compares it with the head of the queue.
    pub(crate) async fn turn(&self, ticket: &WaitTicket) -> Result<Turn, StoreError> {
        let alive = with_retry("touch_ticket", self.retry_budget, &self.backoff, || {
            self.store.touch_ticket(ticket, self.ticket_ttl)
        })
        .await?;
        if !alive {
            return Ok(Turn::Expired);
        }

        let head = with_retry("queue_head", self.retry_budget, &self.backoff, || {
            self.store.queue_head(&ticket.key)
        })
        .await?;

        Ok(match head {
            Some(head) if head.sequence == ticket.sequence => Turn::First,
            Some(_) => Turn::Behind,
            None => Turn::Expired,
        })
    }

    pub(crate) async fn dequeue(&self, ticket: &WaitTicket) -> Result<bool, StoreError> {
        let removed = with_retry("dequeue", self.retry_budget, &self.backoff, || {
            self.store.dequeue(ticket)
        })
        .await?;

        debug!(
            key = %ticket.key,
            holder_id = %ticket.holder_id,
            sequence = ticket.sequence,
            removed,
            "dequeued wait ticket"
        );
        self.notify_released(&ticket.key);
        Ok(removed)
    }

    /// Shared wake-up signal for waiters on `key` in this process.
    pub(crate) fn notifier(&self, key: &str) -> Arc<Notify> {
        self.notifiers()
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wakes every local waiter on `key`; only the head will go for the lock.
    pub(crate) fn notify_released(&self, key: &str) {
        let mut notifiers = self.notifiers();
        if let Some(notify) = notifiers.get(key) {
            notify.notify_waiters();
            if Arc::strong_count(notify) == 1 {
                notifiers.remove(key);
            }
        }
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn watch(&self, key: &str) -> Option<WatchStream> {
        self.store.watch(key)
    }

    fn notifiers(&self) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.notifiers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sleeps until `released` fires, the store reports a change, or `delay` passes.
///
/// `released` must be created before the caller checks the lock state, so a
/// release that lands in between is not missed.
pub(crate) async fn wait_for_wakeup(
    released: Notified<'_>,
    watch: &mut Option<WatchStream>,
    delay: Duration,
) {
    tokio::select! {
        _ = released => {}
        _ = next_event(watch) => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn next_event(watch: &mut Option<WatchStream>) {
    let ended = match watch.as_mut() {
        Some(stream) => stream.next().await.is_none(),
        None => true,
    };

    if ended {
        *watch = None;
        futures::future::pending::<()>().await;
    }
}

/// Owns a ticket until it is explicitly dequeued.
///
/// Dropping the guard with the ticket still queued (the acquiring future was
/// cancelled) removes the ticket in the background.
pub(crate) struct TicketGuard {
    queue: Arc<WaitQueue>,
    ticket: Option<WaitTicket>,
}

impl TicketGuard {
    pub(crate) fn new(queue: Arc<WaitQueue>, ticket: WaitTicket) -> Self {
        Self {
            queue,
            ticket: Some(ticket),
        }
    }

    pub(crate) fn ticket(&self) -> Option<&WaitTicket> {
        self.ticket.as_ref()
    }

    /// Swaps in a fresh ticket after the old one aged out.
    pub(crate) fn replace(&mut self, ticket: WaitTicket) {
        self.ticket = Some(ticket);
    }

    /// Removes the ticket from the store. Failures are logged; the ticket ages out anyway.
    pub(crate) async fn dequeue(&mut self) {
        if let Some(ticket) = self.ticket.clone() {
            let removed = self.queue.dequeue(&ticket).await;
            self.ticket = None;
            if let Err(error) = removed {
                warn!(
                    key = %ticket.key,
                    holder_id = %ticket.holder_id,
                    sequence = ticket.sequence,
                    error = %error,
                    "failed to dequeue wait ticket, leaving it to expire"
                );
            }
        }
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let queue = self.queue.clone();
                runtime.spawn(async move {
                    if let Err(error) = queue.dequeue(&ticket).await {
                        warn!(
                            key = %ticket.key,
                            sequence = ticket.sequence,
                            error = %error,
                            "failed to dequeue abandoned wait ticket"
                        );
                    }
                });
            }
            Err(_) => warn!(
                key = %ticket.key,
                sequence = ticket.sequence,
                "no runtime to dequeue abandoned wait ticket, leaving it to expire"
            ),
        }
    }
}
