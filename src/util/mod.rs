use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

pub(crate) mod retry;
pub(crate) mod runnable;

/// Picks a delay uniformly from `[delay / 2, delay]` so racing clients drift apart.
pub(crate) fn jittered(delay: Duration) -> Duration {
    let half = delay / 2;
    let spread = u64::try_from((delay - half).as_micros()).unwrap_or(u64::MAX);
    if spread == 0 {
        return delay;
    }
    half + Duration::from_micros(rand::thread_rng().gen_range(0..=spread))
}

/// Point in time after which a lock attempt gives up. `None` waits forever.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started: Instant,
    at: Option<Instant>,
}

impl Deadline {
    pub(crate) fn new(bound: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: bound.map(|bound| started + bound),
        }
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// How long one store call may take: until `grace` past the deadline, or
    /// `cap` when there is none.
    pub(crate) fn call_budget(&self, grace: Duration, cap: Duration) -> Duration {
        match self.at {
            Some(at) => (at + grace).saturating_duration_since(Instant::now()),
            None => cap,
        }
    }

    /// Shortens `delay` so a sleep never runs past the deadline.
    pub(crate) fn clamp(&self, delay: Duration) -> Duration {
        match self.at {
            Some(at) => delay.min(at.saturating_duration_since(Instant::now())),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_and_full_delay() {
        let delay = Duration::from_millis(200);
        for _ in 0..100 {
            let value = jittered(delay);
            assert!(value >= Duration::from_millis(100));
            assert!(value <= delay);
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_clamps_sleeps_to_remaining_time() {
        let deadline = Deadline::new(Some(Duration::from_millis(100)));
        assert!(!deadline.expired());
        assert_eq!(deadline.clamp(Duration::from_secs(1)), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(deadline.clamp(Duration::from_secs(1)), Duration::from_millis(40));

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(deadline.expired());
        assert_eq!(deadline.clamp(Duration::from_secs(1)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_deadline_never_expires() {
        let deadline = Deadline::new(None);
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(!deadline.expired());
        assert_eq!(deadline.clamp(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn call_budget_runs_one_grace_period_past_the_deadline() {
        let grace = Duration::from_millis(100);
        let cap = Duration::from_secs(5);

        let bounded = Deadline::new(Some(Duration::from_millis(200)));
        assert_eq!(bounded.call_budget(grace, cap), Duration::from_millis(300));
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(bounded.call_budget(grace, cap), Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(bounded.call_budget(grace, cap), Duration::ZERO);

        assert_eq!(Deadline::new(None).call_budget(grace, cap), cap);
    }
}
