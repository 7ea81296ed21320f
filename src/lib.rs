//! Lease-based distributed locks.
//!
//! A [`LockCoordinator`] serializes access to named resources across
//! processes that share a [`LeaseStore`]. Locks are leases: the store forgets
//! a holder whose lease runs out, and a background watchdog renews the lease
//! while the holder is alive. If renewal fails the holder is told
//! ([`LockError::LeaseLost`]) instead of carrying on under a false assumption
//! of exclusivity.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lease_lock::{task, InMemoryLeaseStore, LockConfig, LockCoordinator};
//!
//! # async fn example() -> Result<(), lease_lock::LockError> {
//! let store = Arc::new(InMemoryLeaseStore::new());
//! let coordinator = LockCoordinator::new(store, LockConfig::default())?;
//!
//! let total = coordinator
//!     .try_lock(task("ledger", || async { 40 + 2 }), false)
//!     .await?;
//! assert_eq!(total, 42);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod lock;
pub mod queue;
pub mod store;
mod util;

pub use config::{BackoffConfig, LockConfig, TimeUnit, DEFAULT_LEASE_TIME, DEFAULT_TRY_TIME};
pub use coordinator::LockCoordinator;
pub use error::{LockError, LockResult, LossReason, StoreError};
pub use lease::{LeaseManager, LeaseState, LeaseStatus};
pub use lock::{
    task, AttemptState, DistributedTask, FnTask, LeaseView, LockDescriptor, LockHandle, LockMode,
    LockOptions, WaitBound,
};
pub use queue::WaitTicket;
pub use store::{DynamoLeaseStore, InMemoryLeaseStore, LeaseStore, StoreResult, WatchStream};
