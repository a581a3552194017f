//! Periodic background tasks.
//!
//! Each [`PeriodicTask`] runs on its own interval. A run that is still in
//! progress when the next tick fires causes that tick to be skipped rather
//! than overlapping. Stopping a task waits for its in-progress run.

mod delay_detection;
mod guard;
mod pickup_reminder;

pub use delay_detection::{DelayDetectionConfig, DelayDetectionTask};
pub use guard::{TaskGuard, TaskPermit};
pub use pickup_reminder::{PickupReminderConfig, PickupReminderTask};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::Result;

#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One pass. Returns how many items were acted on.
    async fn run_once(&self) -> Result<usize>;
}

/// Drive `task` on its interval until `cancel` fires. The returned handle
/// completes once the last started run has finished.
pub fn spawn_periodic(task: Arc<dyn PeriodicTask>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let guard = TaskGuard::new(task.name());
        let runs = TaskTracker::new();
        let mut ticker = tokio::time::interval(task.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(task = task.name(), interval = ?task.interval(), "Periodic task started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(permit) = guard.try_enter() else {
                debug!(task = task.name(), "Previous run still in progress, skipping tick");
                continue;
            };

            let task = Arc::clone(&task);
            runs.spawn(async move {
                let _permit = permit;
                match task.run_once().await {
                    Ok(0) => {}
                    Ok(count) => debug!(task = task.name(), count, "Periodic task run finished"),
                    Err(e) => warn!(task = task.name(), error = %e, "Periodic task run failed"),
                }
            });
        }

        runs.close();
        runs.wait().await;
        info!(task = task.name(), "Periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowTask {
        running: AtomicUsize,
        max_running: AtomicUsize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for SlowTask {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn run_once(&self) -> Result<usize> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_slow_runs_never_overlap() {
        let task = Arc::new(SlowTask {
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(task.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(task.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(task.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_run_in_progress() {
        let task = Arc::new(SlowTask {
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(task.clone(), cancel.clone());

        // The first tick fires immediately; cancel mid-run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.running.load(Ordering::SeqCst), 1);
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(task.running.load(Ordering::SeqCst), 0);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }
}
