use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Notify;

/// What a periodic task wants to happen after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    After(Duration),
    Stop,
}

/// Drives `runnable` until it returns [`Next::Stop`] or `shutdown` is notified.
///
/// The delay before each run is chosen by the previous run, so a task can
/// speed up while it is retrying. A run that has already started is allowed to
/// finish; shutdown only interrupts the sleep between runs.
pub(crate) async fn run_with_delay<T: PeriodicRunnable + ?Sized>(
    runnable: Arc<T>,
    first_delay: Duration,
    shutdown: Arc<Notify>,
) {
    let mut delay = first_delay;
    loop {
        let mut shutdown_signal = false;
        tokio::select! {
            _ = shutdown.notified() => { shutdown_signal = true }
            _ = tokio::time::sleep(delay) => {}
        }

        if shutdown_signal {
            break;
        }

        match runnable.run_once().await {
            Next::After(next_delay) => delay = next_delay,
            Next::Stop => break,
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    async fn run_once(&self) -> Next;
    async fn before_shutdown_complete(&self) {}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct Countdown {
        runs: AtomicUsize,
        limit: usize,
        finished: AtomicBool,
    }

    #[async_trait]
    impl PeriodicRunnable for Countdown {
        async fn run_once(&self) -> Next {
            let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if runs >= self.limit {
                Next::Stop
            } else {
                Next::After(Duration::from_millis(10))
            }
        }

        async fn before_shutdown_complete(&self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn countdown(limit: usize) -> Arc<Countdown> {
        Arc::new(Countdown {
            runs: AtomicUsize::new(0),
            limit,
            finished: AtomicBool::new(false),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_the_runnable_asks() {
        let runnable = countdown(4);
        run_with_delay(runnable.clone(), Duration::from_millis(10), Arc::new(Notify::new())).await;

        assert_eq!(runnable.runs.load(Ordering::SeqCst), 4);
        assert!(runnable.finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signal_sent_before_the_wait_is_not_lost() {
        let runnable = countdown(usize::MAX);
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();

        run_with_delay(runnable.clone(), Duration::from_secs(60), shutdown).await;

        assert_eq!(runnable.runs.load(Ordering::SeqCst), 0);
        assert!(runnable.finished.load(Ordering::SeqCst));
    }
}
