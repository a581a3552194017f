//! Service container.
//!
//! Builds every component from an [`AppConfig`] and owns their background
//! tasks from [`ServiceContainer::initialize`] to
//! [`ServiceContainer::shutdown`].

use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::api::AppState;
use crate::bus::EventBus;
use crate::change_feed::{ChangeEventSource, ChangeLogPruner, SqliteChangeFeed};
use crate::config::AppConfig;
use crate::database::repositories::{
    SqlxCheckpointRepository, SqlxNotificationRepository, SqlxRideRepository,
};
use crate::dispatch::DispatchWorkerPool;
use crate::domain::DeliveryReceipt;
use crate::notification::{MessageTemplates, RideNotificationHandler};
use crate::queue::NotificationQueue;
use crate::reconciler::DeliveryReconciler;
use crate::scheduler::{DelayDetectionTask, PickupReminderTask, spawn_periodic};
use crate::sender::{HttpSmsSender, LogSender, NotificationSender};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub queue: Arc<NotificationQueue>,
    pub dispatcher: Arc<DispatchWorkerPool>,
    pub reconciler: Arc<DeliveryReconciler>,
    pub rides: Arc<SqlxRideRepository>,
    pub change_source: Arc<ChangeEventSource>,
    pub pickup_reminders: Arc<PickupReminderTask>,
    pub delay_detection: Arc<DelayDetectionTask>,
    pub change_log_pruner: Arc<ChangeLogPruner>,
    receipt_tx: mpsc::Sender<DeliveryReceipt>,
    receipt_rx: Mutex<Option<mpsc::Receiver<DeliveryReceipt>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Wire everything with the sender the configuration asks for.
    pub async fn new(pool: SqlitePool, config: AppConfig) -> Result<Self> {
        let sender: Arc<dyn NotificationSender> = match &config.sms {
            Some(sms) => {
                info!(endpoint = %sms.endpoint, "Using HTTP SMS sender");
                Arc::new(HttpSmsSender::new(sms.clone())?)
            }
            None => {
                warn!("SMS_ENDPOINT not set, notifications will only be logged");
                Arc::new(LogSender)
            }
        };
        Self::with_sender(pool, config, sender).await
    }

    pub async fn with_sender(
        pool: SqlitePool,
        config: AppConfig,
        sender: Arc<dyn NotificationSender>,
    ) -> Result<Self> {
        info!("Initializing service container");

        let notification_repo = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let rides = Arc::new(SqlxRideRepository::new(pool.clone()));
        let checkpoints = Arc::new(SqlxCheckpointRepository::new(pool.clone()));

        let queue = Arc::new(NotificationQueue::new(notification_repo, config.queue.clone()));
        let dispatcher = DispatchWorkerPool::new(config.dispatch.clone(), queue.clone(), sender);

        let bus = Arc::new(EventBus::new());
        Arc::new(RideNotificationHandler::new(
            queue.clone(),
            MessageTemplates::default(),
        ))
        .register(&bus);

        let feed = Arc::new(
            SqliteChangeFeed::new(rides.clone(), config.change_feed_poll)
                .with_batch_size(config.change_feed_batch),
        );
        let change_source = Arc::new(ChangeEventSource::new(
            feed,
            rides.clone(),
            checkpoints.clone(),
            bus.clone(),
            config.change_source.clone(),
        ));
        let change_log_pruner = Arc::new(ChangeLogPruner::new(
            rides.clone(),
            checkpoints,
            change_source.subscriptions().to_vec(),
            config.change_log_prune.clone(),
        ));

        let pickup_reminders = Arc::new(PickupReminderTask::new(
            rides.clone(),
            bus.clone(),
            config.reminder.clone(),
        ));
        let delay_detection = Arc::new(DelayDetectionTask::new(
            rides.clone(),
            bus.clone(),
            config.delay.clone(),
        ));

        let reconciler = Arc::new(DeliveryReconciler::new(
            queue.clone(),
            config.reconciler.clone(),
        ));
        let (receipt_tx, receipt_rx) = mpsc::channel(config.receipt_buffer);

        info!("Service container initialized");

        Ok(Self {
            pool,
            config,
            bus,
            queue,
            dispatcher,
            reconciler,
            rides,
            change_source,
            pickup_reminders,
            delay_detection,
            change_log_pruner,
            receipt_tx,
            receipt_rx: Mutex::new(Some(receipt_rx)),
            tasks: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start every background task. Calling it twice is an error.
    pub async fn initialize(&self) -> Result<()> {
        let receipts = self
            .receipt_rx
            .lock()
            .take()
            .ok_or_else(|| crate::Error::Other("service container already initialized".into()))?;

        self.queue.recover().await?;
        self.dispatcher.ensure_running();

        let cancel = self.cancellation_token.clone();
        let mut handles = self.change_source.start(cancel.clone());
        handles.push(spawn_periodic(self.pickup_reminders.clone(), cancel.clone()));
        handles.push(spawn_periodic(self.delay_detection.clone(), cancel.clone()));
        handles.push(spawn_periodic(self.change_log_pruner.clone(), cancel.clone()));
        handles.push(self.reconciler.clone().spawn(receipts, cancel));
        self.tasks.lock().extend(handles);

        info!(
            subscriptions = self.change_source.subscriptions().len(),
            concurrency = self.config.dispatch.concurrency_limit,
            "Services started"
        );
        Ok(())
    }

    /// State for the HTTP API.
    pub fn app_state(&self) -> AppState {
        AppState::new(self.queue.clone(), self.receipt_tx.clone())
            .with_dispatcher(self.dispatcher.clone())
    }

    pub fn receipt_sender(&self) -> mpsc::Sender<DeliveryReceipt> {
        self.receipt_tx.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop background tasks, let in-flight sends finish, close the pool.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let drained = tokio::time::timeout(timeout, async {
            self.dispatcher.stop().await;
            futures::future::join_all(handles).await;
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "Shutdown timeout reached, in-flight sends will be recovered by the stale sweep"
            );
        }

        self.pool.close().await;
        info!("Services shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;

    #[tokio::test]
    async fn test_initialize_once_and_shutdown() {
        let pool = init_memory_pool().await.unwrap();
        let container = ServiceContainer::with_sender(pool, AppConfig::default(), Arc::new(LogSender))
            .await
            .unwrap();

        container.initialize().await.unwrap();
        assert!(container.initialize().await.is_err());

        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(container.is_shutting_down());
    }
}
