use std::{fmt, time::Duration};

use crate::error::{LockError, LockResult};

mod handle;
mod task;

pub use handle::{LeaseView, LockHandle};
pub use task::{task, DistributedTask, FnTask};

/// Names the resource to lock and the party that wants it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockDescriptor {
    key: String,
    holder_id: String,
}

impl LockDescriptor {
    /// Fails with [`LockError::InvalidDescriptor`] when either part is blank.
    pub fn new(key: impl Into<String>, holder_id: impl Into<String>) -> LockResult<Self> {
        let key = key.into();
        let holder_id = holder_id.into();

        if key.trim().is_empty() {
            return Err(LockError::InvalidDescriptor(
                "lock key must not be empty".to_owned(),
            ));
        }

        if holder_id.trim().is_empty() {
            return Err(LockError::InvalidDescriptor(
                "lock holder_id must not be empty".to_owned(),
            ));
        }

        Ok(Self { key, holder_id })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Waiters acquire in the order they asked.
    Fair,
    /// Waiters race; whoever hits the store first wins.
    Unfair,
}

impl LockMode {
    pub fn is_fair(self) -> bool {
        self == LockMode::Fair
    }
}

impl From<bool> for LockMode {
    fn from(fair: bool) -> Self {
        if fair {
            LockMode::Fair
        } else {
            LockMode::Unfair
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Fair => write!(f, "fair"),
            LockMode::Unfair => write!(f, "unfair"),
        }
    }
}

/// How long an acquisition may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBound {
    Forever,
    Within(Duration),
}

impl WaitBound {
    pub(crate) fn as_option(self) -> Option<Duration> {
        match self {
            WaitBound::Forever => None,
            WaitBound::Within(bound) => Some(bound),
        }
    }
}

/// Per-call acquisition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub mode: LockMode,
    pub wait: WaitBound,
    pub lease_ttl: Duration,
}

impl LockOptions {
    pub fn new(mode: LockMode, wait: WaitBound, lease_ttl: Duration) -> Self {
        Self {
            mode,
            wait,
            lease_ttl,
        }
    }

    pub(crate) fn validate(&self) -> LockResult<()> {
        if self.lease_ttl.is_zero() {
            return Err(LockError::InvalidDescriptor(
                "lease ttl must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of one lock attempt.
///
/// `Idle → Enqueued (fair only) → Acquiring → Held → Releasing → Released`,
/// failing into `TimedOut` while acquiring or `Lost` while held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptState {
    Idle,
    Enqueued,
    Acquiring,
    Held,
    Releasing,
    Released,
    TimedOut,
    Lost,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Released | AttemptState::TimedOut | AttemptState::Lost
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Idle => "idle",
            AttemptState::Enqueued => "enqueued",
            AttemptState::Acquiring => "acquiring",
            AttemptState::Held => "held",
            AttemptState::Releasing => "releasing",
            AttemptState::Released => "released",
            AttemptState::TimedOut => "timed_out",
            AttemptState::Lost => "lost",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_rejects_blank_parts() {
        assert!(matches!(
            LockDescriptor::new("", "holder"),
            Err(LockError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            LockDescriptor::new("orders", "   "),
            Err(LockError::InvalidDescriptor(_))
        ));

        let descriptor = LockDescriptor::new("orders", "node-a:1").unwrap();
        assert_eq!(descriptor.key(), "orders");
        assert_eq!(descriptor.holder_id(), "node-a:1");
    }

    #[test]
    fn fairness_flag_maps_to_mode() {
        assert_eq!(LockMode::from(true), LockMode::Fair);
        assert_eq!(LockMode::from(false), LockMode::Unfair);
        assert!(LockMode::Fair.is_fair());
    }

    #[test]
    fn zero_ttl_options_are_invalid() {
        let options = LockOptions::new(LockMode::Unfair, WaitBound::Forever, Duration::ZERO);
        assert!(matches!(
            options.validate(),
            Err(LockError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn terminal_states() {
        assert!(AttemptState::TimedOut.is_terminal());
        assert!(AttemptState::Lost.is_terminal());
        assert!(!AttemptState::Held.is_terminal());
        assert_eq!(AttemptState::TimedOut.to_string(), "timed_out");
    }
}
