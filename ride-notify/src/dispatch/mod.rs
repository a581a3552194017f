//! Dispatch worker pool.
//!
//! A single loop ticks over the queue: it first returns abandoned claims to
//! the retry path, then claims as many eligible items as there are free
//! concurrency permits and hands each to the sender on its own task. The
//! loop parks itself when the queue has nothing pending or processing and
//! is restarted by the next enqueue.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::domain::{NotificationItem, NotificationStatus};
use crate::queue::{DispatchWaker, NotificationQueue};
use crate::scheduler::TaskGuard;
use crate::sender::{NotificationSender, SendError};
use crate::{Error, Result};

/// Dispatch pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub tick_interval: Duration,
    /// Maximum sends in flight at once.
    pub concurrency_limit: usize,
    /// A `processing` claim older than this is considered abandoned.
    pub stale_after: Duration,
    /// Upper bound on one send attempt. Must be below `stale_after` so a
    /// live send is never swept.
    pub send_timeout: Duration,
    /// Maximum stale claims released per tick.
    pub stale_sweep_batch: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            concurrency_limit: 8,
            stale_after: Duration::from_secs(30),
            send_timeout: Duration::from_secs(20),
            stale_sweep_batch: 100,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(Error::config("dispatch concurrency limit must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::config("dispatch tick interval must be positive"));
        }
        if self.send_timeout >= self.stale_after {
            return Err(Error::config(format!(
                "send timeout ({:?}) must be shorter than the stale threshold ({:?})",
                self.send_timeout, self.stale_after
            )));
        }
        Ok(())
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Another tick was still running; nothing was done.
    pub skipped: bool,
    /// Stale claims returned to the retry path.
    pub released: usize,
    pub claimed: usize,
    /// Nothing pending or processing anywhere in the queue.
    pub idle: bool,
}

/// Decrements the in-flight counter even if the send task panics.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DispatchWorkerPool {
    config: DispatchConfig,
    queue: Arc<NotificationQueue>,
    sender: Arc<dyn NotificationSender>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    tick_guard: TaskGuard,
    loop_running: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    self_ref: Weak<DispatchWorkerPool>,
}

impl DispatchWorkerPool {
    /// Create the pool and register it with the queue so that enqueues
    /// (re)start the dispatch loop.
    pub fn new(
        config: DispatchConfig,
        queue: Arc<NotificationQueue>,
        sender: Arc<dyn NotificationSender>,
    ) -> Arc<Self> {
        let pool = Arc::new_cyclic(|self_ref| Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency_limit)),
            config,
            queue: Arc::clone(&queue),
            sender,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            tick_guard: TaskGuard::new("dispatch_tick"),
            loop_running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            self_ref: self_ref.clone(),
        });

        let waker: Weak<dyn DispatchWaker> = Arc::downgrade(&pool) as Weak<dyn DispatchWaker>;
        queue.attach_dispatcher(waker);
        pool
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Start the dispatch loop unless it is already running or the pool was
    /// stopped. Returns `true` if this call started it.
    pub fn ensure_running(self: &Arc<Self>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self
            .loop_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        info!(
            sender = self.sender.name(),
            concurrency = self.config.concurrency_limit,
            "Dispatch loop started"
        );
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.run_loop().await;
        });
        true
    }

    pub fn is_running(&self) -> bool {
        self.loop_running.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent sends observed since creation.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn run_loop(&self) {
        let notifier = self.queue.notifier();

        loop {
            let report = match self.tick().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Dispatch tick failed");
                    TickReport::default()
                }
            };

            if report.idle {
                self.loop_running.store(false, Ordering::SeqCst);
                // Work enqueued between the idle check and the reset above
                // found the flag still set and did not start a loop.
                let has_work = match self.queue.stats().await {
                    Ok(stats) => stats.counts.active() > 0,
                    Err(_) => true,
                };
                if has_work
                    && self
                        .loop_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                debug!("Queue idle, dispatch loop parked");
                return;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = notifier.notified() => {}
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }

        self.loop_running.store(false, Ordering::SeqCst);
        debug!("Dispatch loop stopped");
    }

    /// Run one dispatch pass. Overlapping calls are skipped, not queued.
    pub async fn tick(&self) -> Result<TickReport> {
        let Some(_permit) = self.tick_guard.try_enter() else {
            debug!("Dispatch tick already running, skipping");
            return Ok(TickReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = TickReport {
            released: self.sweep_stale().await?,
            ..Default::default()
        };

        let capacity = self.semaphore.available_permits();
        if capacity > 0 && !self.shutdown.is_cancelled() {
            for mut item in self.queue.list_eligible(capacity).await? {
                let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                    break;
                };
                match self.queue.claim(&item.id).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(id = %item.id, error = %e, "Failed to claim notification");
                        continue;
                    }
                }
                item.status = NotificationStatus::Processing;
                item.claimed_at = Some(Utc::now());
                self.spawn_send(item, permit);
                report.claimed += 1;
            }
        }

        if report.claimed == 0 && report.released == 0 && self.in_flight() == 0 {
            report.idle = self.queue.stats().await?.counts.active() == 0;
        }

        Ok(report)
    }

    /// Return claims that outlived `stale_after` to the retry path.
    async fn sweep_stale(&self) -> Result<usize> {
        let stale = self
            .queue
            .stale_processing(self.config.stale_after, self.config.stale_sweep_batch)
            .await?;

        let mut released = 0;
        for item in stale {
            let reason = format!(
                "claim abandoned for more than {}s",
                self.config.stale_after.as_secs()
            );
            match self.queue.release_stale(&item.id, &reason).await {
                Ok(outcome) => {
                    debug!(id = %item.id, ?outcome, "Released stale claim");
                    released += 1;
                }
                Err(e) => warn!(id = %item.id, error = %e, "Failed to release stale claim"),
            }
        }
        Ok(released)
    }

    fn spawn_send(&self, item: NotificationItem, permit: OwnedSemaphorePermit) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let in_flight = InFlight(Arc::clone(&self.in_flight));

        let queue = Arc::clone(&self.queue);
        let sender = Arc::clone(&self.sender);
        let timeout = self.config.send_timeout;

        self.tasks.spawn(async move {
            let _in_flight = in_flight;
            let _permit = permit;
            deliver(&queue, sender.as_ref(), &item, timeout).await;
        });
    }

    /// Stop dispatching and wait for in-flight sends to finish.
    pub async fn stop(&self) {
        info!(in_flight = self.in_flight(), "Stopping dispatch pool");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Dispatch pool stopped");
    }

    /// Wait until no send is in flight. Intended for tests and shutdown.
    pub async fn wait_for_idle(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl DispatchWaker for DispatchWorkerPool {
    fn wake(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            this.ensure_running();
        }
    }
}

/// Perform one send attempt and record its outcome.
async fn deliver(
    queue: &NotificationQueue,
    sender: &dyn NotificationSender,
    item: &NotificationItem,
    timeout: Duration,
) {
    debug!(id = %item.id, recipient = %item.recipient, attempt = item.retry_count + 1, "Sending notification");

    let recorded = match tokio::time::timeout(timeout, sender.send(item)).await {
        Ok(Ok(receipt)) => queue
            .mark_sent(&item.id, receipt.provider_message_ref)
            .await
            .map(drop),
        Ok(Err(SendError::Transient(reason))) => {
            queue.mark_failed(&item.id, &reason).await.map(drop)
        }
        Ok(Err(SendError::Terminal(reason))) => queue
            .mark_failed_permanently(&item.id, &reason)
            .await
            .map(drop),
        Err(_) => queue
            .mark_failed(&item.id, &format!("send timed out after {timeout:?}"))
            .await
            .map(drop),
    };

    if let Err(e) = recorded {
        // The claim stays `processing`; the stale sweep picks it up.
        error!(id = %item.id, error = %e, "Failed to record send outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.concurrency_limit, 8);
        assert_eq!(config.stale_after, Duration::from_secs(30));
    }

    #[test]
    fn test_send_timeout_must_undercut_stale_threshold() {
        let config = DispatchConfig {
            send_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = DispatchConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_tick_releases_abandoned_claim() {
        use crate::database::init_memory_pool;
        use crate::database::repositories::SqlxNotificationRepository;
        use crate::domain::{FailureSource, NewNotification};
        use crate::queue::QueueConfig;
        use crate::sender::LogSender;

        let pool = init_memory_pool().await.unwrap();
        let queue = Arc::new(NotificationQueue::new(
            Arc::new(SqlxNotificationRepository::new(pool)),
            QueueConfig::default(),
        ));
        let id = queue
            .enqueue(NewNotification::sms("+1", "Your driver is on the way"))
            .await
            .unwrap();
        // Claimed by a worker that never came back.
        assert!(queue.claim(&id).await.unwrap());

        let dispatcher = DispatchWorkerPool::new(
            DispatchConfig {
                stale_after: Duration::from_millis(50),
                send_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            queue.clone(),
            Arc::new(LogSender),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.claimed, 0);

        let item = queue.get(&id).await.unwrap();
        assert_eq!(item.status, NotificationStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(
            item.metadata.retry_history[0].source,
            FailureSource::StaleClaim
        );
        assert!(item.scheduled_time.is_some_and(|at| at > Utc::now()));

        dispatcher.stop().await;
    }
}
