//! Shared alarm service for listener timeouts
//!
//! One scheduler is shared by every session. Alarms sleep independently, but
//! at most `pool_size` alarm bodies run at once; the rest wait for a permit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::trace;

/// Default number of alarm bodies allowed to run concurrently
pub const DEFAULT_TIMER_POOL_SIZE: usize = 10;

#[derive(Debug)]
pub struct TimeoutScheduler {
    pool_size: usize,
    permits: Arc<Semaphore>,
}

impl TimeoutScheduler {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            pool_size,
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Alarm bodies currently running
    pub fn active(&self) -> usize {
        self.pool_size - self.permits.available_permits()
    }

    /// Run `task` once after `delay`
    ///
    /// Aborting the returned handle before the delay elapses cancels the
    /// alarm. Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            trace!("Alarm fired after {:?}", delay);
            task.await;
        });
        handle.abort_handle()
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TIMER_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_alarm_fires_once_after_delay() {
        let scheduler = TimeoutScheduler::default();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        scheduler.schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_alarm_never_fires() {
        let scheduler = TimeoutScheduler::default();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let handle = scheduler.schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.abort();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrent_alarms() {
        let scheduler = TimeoutScheduler::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            scheduler.schedule(Duration::from_millis(10), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.active(), 0);
    }
}
