//! Await-then-reschedule loops
//!
//! ```text
//!   start ──▶ sleep(delay) ──▶ tick() ──▶ sleep(next) ──▶ tick() ...
//!                  │                │
//!                  └── cancelled ───┴──▶ stopped
//! ```
//!
//! A run is never started while the previous one is in flight. Once
//! [`Ticker::stop`] returns, the callback will not run again.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Ticker {
    name: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    /// Start a loop that first runs after `initial_delay`.
    ///
    /// `tick` returns the delay before its next run.
    pub fn start<F, Fut>(name: impl Into<String>, initial_delay: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Duration> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let loop_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    next = tick() => next,
                };
            }
            debug!(ticker = %loop_name, "Ticker stopped");
        });

        Self {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_reschedules_with_returned_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let ticker = Ticker::start("test", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Duration::from_secs(10)
            }
        });

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        ticker.stop().await;
        assert!(ticker.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_run_after_stop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let ticker = Ticker::start("stopped", Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Duration::from_secs(5)
            }
        });

        ticker.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (a, b) = (in_flight.clone(), max_seen.clone());
        let ticker = Ticker::start("slow", Duration::ZERO, move || {
            let (in_flight, max_seen) = (a.clone(), b.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Duration::from_millis(100)
            }
        });

        tokio::time::sleep(Duration::from_secs(20)).await;
        ticker.stop().await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
