use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::{
    sync::{broadcast, watch},
    time::Instant,
};

use crate::{error::StoreError, queue::WaitTicket};

use super::{LeaseStore, StoreResult, WatchStream};

struct LeaseRecord {
    holder_id: String,
    expires_at: Instant,
}

struct QueuedTicket {
    ticket: WaitTicket,
    expires_at: Instant,
}

#[derive(Default)]
struct KeySpace {
    lease: Option<LeaseRecord>,
    queue: BTreeMap<u64, QueuedTicket>,
    next_sequence: u64,
    events: Option<broadcast::Sender<()>>,
}

impl KeySpace {
    fn live_holder(&self, now: Instant) -> Option<&str> {
        self.lease
            .as_ref()
            .filter(|record| record.expires_at > now)
            .map(|record| record.holder_id.as_str())
    }

    fn prune_tickets(&mut self, now: Instant) -> bool {
        let before = self.queue.len();
        self.queue.retain(|_, queued| queued.expires_at > now);
        before != self.queue.len()
    }

    fn publish(&self) {
        if let Some(events) = &self.events {
            let _ = events.send(());
        }
    }
}

/// Process-local [`LeaseStore`] on the tokio clock.
///
/// Coordinators sharing one instance behave like processes sharing a remote
/// store, which makes it the reference backend for tests. Fault injection
/// simulates outages (`set_reachable`), partitions where calls never answer
/// (`set_stalled`, `stall_renewals`) and stalled holders (`expire`).
pub struct InMemoryLeaseStore {
    keys: Mutex<HashMap<String, KeySpace>>,
    reachable: AtomicBool,
    stalled: watch::Sender<bool>,
    renewals_stalled: watch::Sender<bool>,
    acquisitions: AtomicU64,
    renewals: AtomicU64,
    releases: AtomicU64,
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            stalled: watch::channel(false).0,
            renewals_stalled: watch::channel(false).0,
            acquisitions: AtomicU64::new(0),
            renewals: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// While unreachable every call fails with [`StoreError::Unavailable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// While stalled every call hangs until the stall is lifted.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.send_replace(stalled);
    }

    /// Like [`set_stalled`](Self::set_stalled), for `renew` only.
    pub fn stall_renewals(&self, stalled: bool) {
        self.renewals_stalled.send_replace(stalled);
    }

    /// Drops the lease on `key` as if its TTL ran out.
    pub fn expire(&self, key: &str) {
        let mut keys = self.keys();
        if let Some(space) = keys.get_mut(key) {
            space.lease = None;
            space.publish();
        }
    }

    /// Number of live tickets waiting on `key`.
    pub fn queue_len(&self, key: &str) -> usize {
        let now = Instant::now();
        self.keys()
            .get(key)
            .map(|space| {
                space
                    .queue
                    .values()
                    .filter(|queued| queued.expires_at > now)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Successful `try_acquire` calls that created or took over a lease.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::SeqCst)
    }

    /// Successful `release` calls.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, KeySpace>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn answer(&self, operation: &str) -> StoreResult<()> {
        wait_while(&self.stalled).await;
        self.check_reachable(operation)
    }

    fn check_reachable(&self, operation: &str) -> StoreResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "{} failed: store unreachable",
                operation
            )))
        }
    }
}

async fn wait_while(flag: &watch::Sender<bool>) {
    let mut state = flag.subscribe();
    while *state.borrow_and_update() {
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> StoreResult<bool> {
        self.answer("try_acquire").await?;
        let now = Instant::now();
        let mut keys = self.keys();
        let space = keys.entry(key.to_owned()).or_default();

        let owned_by_caller = space.live_holder(now).map(|current| current == holder_id);
        match owned_by_caller {
            Some(false) => Ok(false),
            Some(true) => {
                if let Some(record) = space.lease.as_mut() {
                    record.expires_at = now + ttl;
                }
                Ok(true)
            }
            None => {
                space.lease = Some(LeaseRecord {
                    holder_id: holder_id.to_owned(),
                    expires_at: now + ttl,
                });
                self.acquisitions.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, holder_id: &str, ttl: Duration) -> StoreResult<bool> {
        wait_while(&self.renewals_stalled).await;
        self.answer("renew").await?;
        let now = Instant::now();
        let mut keys = self.keys();
        let record = keys
            .get_mut(key)
            .and_then(|space| space.lease.as_mut())
            .filter(|record| record.expires_at > now && record.holder_id == holder_id);

        match record {
            Some(record) => {
                record.expires_at = now + ttl;
                self.renewals.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder_id: &str) -> StoreResult<bool> {
        self.answer("release").await?;
        let mut keys = self.keys();
        let Some(space) = keys.get_mut(key) else {
            return Ok(false);
        };

        let owned = matches!(&space.lease, Some(record) if record.holder_id == holder_id);
        if !owned {
            return Ok(false);
        }

        space.lease = None;
        space.publish();
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn current_holder(&self, key: &str) -> StoreResult<Option<String>> {
        self.answer("current_holder").await?;
        let now = Instant::now();
        Ok(self
            .keys()
            .get(key)
            .and_then(|space| space.live_holder(now))
            .map(str::to_owned))
    }

    async fn enqueue(
        &self,
        key: &str,
        holder_id: &str,
        ticket_ttl: Duration,
    ) -> StoreResult<WaitTicket> {
        self.answer("enqueue").await?;
        let now = Instant::now();
        let mut keys = self.keys();
        let space = keys.entry(key.to_owned()).or_default();

        space.next_sequence += 1;
        let ticket = WaitTicket {
            key: key.to_owned(),
            holder_id: holder_id.to_owned(),
            enqueued_at: SystemTime::now(),
            sequence: space.next_sequence,
        };
        space.queue.insert(
            ticket.sequence,
            QueuedTicket {
                ticket: ticket.clone(),
                expires_at: now + ticket_ttl,
            },
        );
        Ok(ticket)
    }

    async fn touch_ticket(&self, ticket: &WaitTicket, ticket_ttl: Duration) -> StoreResult<bool> {
        self.answer("touch_ticket").await?;
        let now = Instant::now();
        let mut keys = self.keys();
        let queued = keys
            .get_mut(&ticket.key)
            .and_then(|space| space.queue.get_mut(&ticket.sequence))
            .filter(|queued| queued.expires_at > now && queued.ticket.holder_id == ticket.holder_id);

        match queued {
            Some(queued) => {
                queued.expires_at = now + ticket_ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dequeue(&self, ticket: &WaitTicket) -> StoreResult<bool> {
        self.answer("dequeue").await?;
        let mut keys = self.keys();
        let Some(space) = keys.get_mut(&ticket.key) else {
            return Ok(false);
        };

        let removed = space.queue.remove(&ticket.sequence).is_some();
        if removed {
            space.publish();
        }
        Ok(removed)
    }

    async fn queue_head(&self, key: &str) -> StoreResult<Option<WaitTicket>> {
        self.answer("queue_head").await?;
        let now = Instant::now();
        let mut keys = self.keys();
        let Some(space) = keys.get_mut(key) else {
            return Ok(None);
        };

        if space.prune_tickets(now) {
            space.publish();
        }
        Ok(space
            .queue
            .values()
            .next()
            .map(|queued| queued.ticket.clone()))
    }

    fn watch(&self, key: &str) -> Option<WatchStream> {
        let mut keys = self.keys();
        let space = keys.entry(key.to_owned()).or_default();
        let receiver = space
            .events
            .get_or_insert_with(|| broadcast::channel(16).0)
            .subscribe();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), receiver)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Some(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn only_one_holder_at_a_time() {
        let store = InMemoryLeaseStore::new();

        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());
        assert!(!store.try_acquire("orders", "b", TTL).await.unwrap());
        assert!(store.try_acquire("invoices", "b", TTL).await.unwrap());
        assert_eq!(
            store.current_holder("orders").await.unwrap().as_deref(),
            Some("a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_by_owner_is_idempotent() {
        let store = InMemoryLeaseStore::new();

        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());
        assert_eq!(store.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_leases_can_be_taken_over() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());

        tokio::time::advance(TTL).await;

        assert_eq!(store.current_holder("orders").await.unwrap(), None);
        assert!(!store.renew("orders", "a", TTL).await.unwrap());
        assert!(store.try_acquire("orders", "b", TTL).await.unwrap());
        assert!(!store.release("orders", "a").await.unwrap());
        assert_eq!(
            store.current_holder("orders").await.unwrap().as_deref(),
            Some("b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_only_for_owner() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.renew("orders", "a", TTL).await.unwrap());
        assert!(!store.renew("orders", "b", TTL).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            store.current_holder("orders").await.unwrap().as_deref(),
            Some("a")
        );
        assert_eq!(store.renewals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_compare_and_delete() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());

        assert!(!store.release("orders", "b").await.unwrap());
        assert!(store.release("orders", "a").await.unwrap());
        assert!(!store.release("orders", "a").await.unwrap());
        assert!(!store.release("unknown", "a").await.unwrap());
        assert_eq!(store.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_orders_by_sequence_and_skips_dead_tickets() {
        let store = InMemoryLeaseStore::new();
        let first = store.enqueue("orders", "a", Duration::from_secs(1)).await.unwrap();
        let second = store.enqueue("orders", "b", Duration::from_secs(10)).await.unwrap();
        let third = store.enqueue("orders", "c", Duration::from_secs(10)).await.unwrap();

        assert!(first.sequence < second.sequence && second.sequence < third.sequence);
        assert_eq!(store.queue_head("orders").await.unwrap(), Some(first.clone()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.touch_ticket(&first, Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.queue_head("orders").await.unwrap(), Some(second.clone()));

        assert!(store.dequeue(&second).await.unwrap());
        assert!(!store.dequeue(&second).await.unwrap());
        assert_eq!(store.queue_head("orders").await.unwrap(), Some(third));
        assert_eq!(store.queue_len("orders"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sequences_keep_growing_after_dequeue() {
        let store = InMemoryLeaseStore::new();
        let first = store.enqueue("orders", "a", TTL).await.unwrap();
        store.dequeue(&first).await.unwrap();
        let second = store.enqueue("orders", "a", TTL).await.unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_fails_every_call() {
        let store = InMemoryLeaseStore::new();
        store.set_reachable(false);

        assert!(matches!(
            store.try_acquire("orders", "a", TTL).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.queue_head("orders").await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_reachable(true);
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn watch_reports_release() {
        let store = InMemoryLeaseStore::new();
        let mut events = store.watch("orders").unwrap();
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());
        assert!(store.release("orders", "a").await.unwrap());

        tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("release should publish an event")
            .expect("stream should stay open");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_calls_hang_until_the_stall_lifts() {
        let store = std::sync::Arc::new(InMemoryLeaseStore::new());
        store.set_stalled(true);

        let pending = {
            let store = store.clone();
            tokio::spawn(async move { store.try_acquire("orders", "a", TTL).await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!pending.is_finished());

        store.set_stalled(false);
        assert_eq!(pending.await.unwrap(), Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_renewals_leave_other_calls_answering() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("orders", "a", TTL).await.unwrap());
        store.stall_renewals(true);

        let renewal = tokio::time::timeout(TTL * 2, store.renew("orders", "a", TTL)).await;
        assert!(renewal.is_err());
        assert!(store.try_acquire("orders", "b", TTL).await.unwrap());
        assert_eq!(store.renewals(), 0);
    }
}
