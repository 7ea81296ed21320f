use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type returned by the coordinator and lock handles.
pub type LockResult<T> = Result<T, LockError>;

/// Failure reported by a [`LeaseStore`](crate::store::LeaseStore) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Transient backend failure. Retried with backoff.
    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request outright. Never retried.
    #[error("lease store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Why a held lease stopped being ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// Renewal kept failing until the retry budget ran out.
    RenewalFailed { attempts: u32, last_error: String },
    /// The store reports another holder (or no holder) for the key.
    Superseded,
    /// More than one TTL passed without a confirmed renewal.
    Expired,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::RenewalFailed {
                attempts,
                last_error,
            } => write!(f, "renewal failed {} times ({})", attempts, last_error),
            LossReason::Superseded => write!(f, "ownership moved to another holder"),
            LossReason::Expired => write!(f, "lease expired before it could be renewed"),
        }
    }
}

/// Every way a lock attempt or a held lock can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock could not be acquired within the wait bound.
    #[error("timed out after {waited:?} waiting for lock `{key}`")]
    AcquisitionTimeout { key: String, waited: Duration },

    /// A held lease can no longer be trusted to be exclusive.
    #[error("lease on `{key}` held by `{holder_id}` was lost: {reason}")]
    LeaseLost {
        key: String,
        holder_id: String,
        reason: LossReason,
    },

    /// The store failed while handling the lock and retries were exhausted.
    #[error("lease store failed while handling lock `{key}`: {source}")]
    StoreUnavailable { key: String, source: StoreError },

    #[error("invalid lock descriptor: {0}")]
    InvalidDescriptor(String),

    /// Release was called on a handle that was already released.
    #[error("lock `{key}` held by `{holder_id}` was already released")]
    DoubleRelease { key: String, holder_id: String },

    /// The handle was released; work that needed the lock must not continue.
    #[error("lock `{key}` is no longer held by `{holder_id}`")]
    NotHeld { key: String, holder_id: String },

    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),
}

impl LockError {
    /// Timeouts are the only failures worth retrying as-is.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::AcquisitionTimeout { .. })
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, LockError::LeaseLost { .. })
    }
}
