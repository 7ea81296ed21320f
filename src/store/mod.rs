//! The coordination backend the coordinator talks to.
//!
//! A [`LeaseStore`] owns the cross-process truth: who holds each key and the
//! fairness queue per key. All atomicity lives here; the coordinator never
//! assumes exclusivity from local state.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{error::StoreError, queue::WaitTicket};

mod dynamo;
mod memory;

pub use dynamo::DynamoLeaseStore;
pub use memory::InMemoryLeaseStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Yields one item whenever something changed for the watched key.
pub type WatchStream = BoxStream<'static, ()>;

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes `key` for `holder_id` if it is free, expired, or already theirs.
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> StoreResult<bool>;

    /// Extends the lease; `false` when `holder_id` no longer owns it.
    async fn renew(&self, key: &str, holder_id: &str, ttl: Duration) -> StoreResult<bool>;

    /// Compare-and-delete. Idempotent; `false` when `holder_id` does not own the key.
    async fn release(&self, key: &str, holder_id: &str) -> StoreResult<bool>;

    async fn current_holder(&self, key: &str) -> StoreResult<Option<String>>;

    /// Appends a waiter with the next sequence number for `key`.
    async fn enqueue(&self, key: &str, holder_id: &str, ticket_ttl: Duration)
        -> StoreResult<WaitTicket>;

    /// Keeps a ticket alive; `false` when it already aged out or was removed.
    async fn touch_ticket(&self, ticket: &WaitTicket, ticket_ttl: Duration) -> StoreResult<bool>;

    async fn dequeue(&self, ticket: &WaitTicket) -> StoreResult<bool>;

    /// Lowest-sequence live ticket for `key`.
    async fn queue_head(&self, key: &str) -> StoreResult<Option<WaitTicket>>;

    /// Push notifications for `key`, if the backend supports them.
    fn watch(&self, _key: &str) -> Option<WatchStream> {
        None
    }
}
