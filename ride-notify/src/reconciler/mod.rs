//! Delivery receipt reconciliation.
//!
//! The provider pushes receipts for messages it accepted. Each receipt is
//! matched to a queue item by the provider reference stored at send time
//! and folded back into the item's state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::domain::{DeliveryReceipt, NotificationStatus, ReceiptStatus};
use crate::queue::{ConfirmOutcome, FailureOutcome, NotificationQueue};

pub const DEFAULT_RETRYABLE_ERROR_CODES: [&str; 4] = ["30001", "30003", "30005", "30008"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Provider error codes worth another attempt. Anything else is final.
    pub retryable_error_codes: BTreeSet<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retryable_error_codes: DEFAULT_RETRYABLE_ERROR_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl ReconcilerConfig {
    pub fn is_retryable(&self, error_code: Option<&str>) -> bool {
        error_code.is_some_and(|code| self.retryable_error_codes.contains(code.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// No item carries the receipt's provider reference.
    Unknown,
    /// Provider accepted the message; nothing to record.
    Acknowledged,
    DeliveryConfirmed,
    AlreadyConfirmed,
    Requeued {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        retry_count: u32,
    },
    /// The item is in a status the receipt does not apply to.
    Ignored {
        status: NotificationStatus,
    },
    /// Receipt status string not understood.
    Unrecognized,
}

impl From<FailureOutcome> for ReconcileOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Requeued {
                retry_count,
                next_attempt_at,
            } => Self::Requeued {
                retry_count,
                next_attempt_at,
            },
            FailureOutcome::Failed { retry_count } => Self::Failed { retry_count },
            FailureOutcome::Ignored { status } => Self::Ignored { status },
        }
    }
}

pub struct DeliveryReconciler {
    queue: Arc<NotificationQueue>,
    config: ReconcilerConfig,
}

impl DeliveryReconciler {
    pub fn new(queue: Arc<NotificationQueue>, config: ReconcilerConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub async fn handle(&self, receipt: &DeliveryReceipt) -> Result<ReconcileOutcome> {
        let Some(provider_ref) = receipt.provider_message_ref.as_deref() else {
            warn!(status = %receipt.status, "Receipt without provider reference dropped");
            return Ok(ReconcileOutcome::Unknown);
        };

        let Some(item) = self.queue.find_by_provider_ref(provider_ref).await? else {
            info!(
                provider_ref = %provider_ref,
                status = %receipt.status,
                "Receipt for untracked message dropped"
            );
            return Ok(ReconcileOutcome::Unknown);
        };

        let outcome = match receipt.classify() {
            ReceiptStatus::InFlight => ReconcileOutcome::Acknowledged,
            ReceiptStatus::Delivered => match self.queue.confirm_delivery(&item.id).await? {
                ConfirmOutcome::Confirmed => ReconcileOutcome::DeliveryConfirmed,
                ConfirmOutcome::AlreadyConfirmed => ReconcileOutcome::AlreadyConfirmed,
                ConfirmOutcome::Ignored { status } => ReconcileOutcome::Ignored { status },
            },
            ReceiptStatus::Failed => {
                let error_code = receipt.error_code.as_deref();
                let retryable = self.config.is_retryable(error_code);
                self.queue
                    .fail_from_receipt(&item.id, &receipt.failure_reason(), error_code, retryable)
                    .await?
                    .into()
            }
            ReceiptStatus::Unknown => {
                warn!(
                    notification_id = %item.id,
                    status = %receipt.status,
                    "Unrecognized receipt status"
                );
                ReconcileOutcome::Unrecognized
            }
        };

        debug!(
            notification_id = %item.id,
            provider_ref = %provider_ref,
            status = %receipt.status,
            error_code = ?receipt.error_code,
            outcome = ?outcome,
            "Receipt reconciled"
        );
        Ok(outcome)
    }

    /// Consume pushed receipts until the channel closes or `cancel` fires.
    pub async fn run(&self, mut receipts: mpsc::Receiver<DeliveryReceipt>, cancel: CancellationToken) {
        info!("Delivery reconciler started");
        loop {
            let receipt = tokio::select! {
                _ = cancel.cancelled() => break,
                receipt = receipts.recv() => receipt,
            };
            let Some(receipt) = receipt else {
                break;
            };
            if let Err(e) = self.handle(&receipt).await {
                error!(
                    provider_ref = ?receipt.provider_message_ref,
                    error = %e,
                    "Failed to reconcile receipt"
                );
            }
        }
        info!("Delivery reconciler stopped");
    }

    pub fn spawn(
        self: Arc<Self>,
        receipts: mpsc::Receiver<DeliveryReceipt>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(receipts, cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::repositories::SqlxNotificationRepository;
    use crate::domain::{NewNotification, ProviderStatus};
    use crate::queue::QueueConfig;

    async fn setup() -> (Arc<NotificationQueue>, DeliveryReconciler) {
        let pool = init_memory_pool().await.unwrap();
        let repo = Arc::new(SqlxNotificationRepository::new(pool));
        let queue = Arc::new(NotificationQueue::new(repo, QueueConfig::default()));
        let reconciler = DeliveryReconciler::new(queue.clone(), ReconcilerConfig::default());
        (queue, reconciler)
    }

    async fn sent_item(queue: &NotificationQueue, provider_ref: &str) -> String {
        let id = queue
            .enqueue(NewNotification::sms("+15550001", "hello"))
            .await
            .unwrap();
        assert!(queue.claim(&id).await.unwrap());
        assert!(queue.mark_sent(&id, Some(provider_ref.to_string())).await.unwrap());
        id
    }

    #[tokio::test]
    async fn test_unknown_ref_is_dropped() {
        let (_queue, reconciler) = setup().await;
        let outcome = reconciler
            .handle(&DeliveryReceipt::new("SM-missing", ProviderStatus::Delivered))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_delivered_confirms_without_state_change() {
        let (queue, reconciler) = setup().await;
        let id = sent_item(&queue, "SM1").await;

        let receipt = DeliveryReceipt::new("SM1", ProviderStatus::Delivered);
        assert_eq!(
            reconciler.handle(&receipt).await.unwrap(),
            ReconcileOutcome::DeliveryConfirmed
        );
        assert_eq!(
            reconciler.handle(&receipt).await.unwrap(),
            ReconcileOutcome::AlreadyConfirmed
        );

        let item = queue.get(&id).await.unwrap();
        assert_eq!(item.status, NotificationStatus::Sent);
        assert!(item.metadata.delivery_confirmed);
    }

    #[tokio::test]
    async fn test_retryable_code_requeues() {
        let (queue, reconciler) = setup().await;
        let id = sent_item(&queue, "SM2").await;

        let receipt =
            DeliveryReceipt::new("SM2", ProviderStatus::Undelivered).with_error_code("30003");
        let outcome = reconciler.handle(&receipt).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Requeued { retry_count: 1, .. }));

        let item = queue.get(&id).await.unwrap();
        assert_eq!(item.status, NotificationStatus::Pending);
        assert_eq!(item.metadata.retry_history.len(), 1);
        assert_eq!(item.metadata.retry_history[0].error_code.as_deref(), Some("30003"));
    }

    #[tokio::test]
    async fn test_non_retryable_code_fails_with_budget_left() {
        let (queue, reconciler) = setup().await;
        let id = sent_item(&queue, "SM3").await;

        let receipt = DeliveryReceipt::new("SM3", ProviderStatus::Failed).with_error_code("21211");
        let outcome = reconciler.handle(&receipt).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Failed { retry_count: 0 });

        let item = queue.get(&id).await.unwrap();
        assert_eq!(item.status, NotificationStatus::Failed);
        assert_eq!(item.retry_count, 0);
        assert!(item.retries_remaining() > 0);
    }

    #[tokio::test]
    async fn test_accepted_is_acknowledged() {
        let (queue, reconciler) = setup().await;
        sent_item(&queue, "SM4").await;
        let outcome = reconciler
            .handle(&DeliveryReceipt::new("SM4", ProviderStatus::Accepted))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (queue, reconciler) = setup().await;
        let id = sent_item(&queue, "SM5").await;
        let reconciler = Arc::new(reconciler);

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = reconciler.clone().spawn(rx, cancel.clone());

        tx.send(DeliveryReceipt::new("SM5", ProviderStatus::Delivered)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(queue.get(&id).await.unwrap().metadata.delivery_confirmed);
    }

    #[test]
    fn test_retryable_codes() {
        let config = ReconcilerConfig::default();
        assert!(config.is_retryable(Some("30001")));
        assert!(config.is_retryable(Some(" 30008 ")));
        assert!(!config.is_retryable(Some("30007")));
        assert!(!config.is_retryable(None));
    }
}
