//! Trailing-edge debouncer

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::repository::lock;

/// Runs only the last job triggered within the quiet period
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `job` after the quiet period, replacing any job not started yet
    pub fn trigger<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Debounced job dropped: no async runtime");
            return;
        };
        let deadline = tokio::time::Instant::now() + self.delay;
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            job.await;
        });
        if let Some(previous) = lock(&self.pending).replace(task) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = lock(&self.pending).take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_collapse_to_last_job() {
        let debouncer = Debouncer::new(Duration::from_millis(1_000));
        let runs = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        for n in 1..=5 {
            let runs = runs.clone();
            let last = last.clone();
            debouncer.trigger(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                last.store(n, Ordering::SeqCst);
            });
            tokio::time::advance(Duration::from_millis(200)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_job() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        debouncer.trigger(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.cancel();
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!debouncer.is_pending());
    }
}
