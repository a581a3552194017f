//! Sender that only writes to the log.

use async_trait::async_trait;
use tracing::info;

use super::{NotificationSender, SendError, SendReceipt};
use crate::domain::NotificationItem;

/// Accepts every item and logs it. Used when no provider is configured.
#[derive(Debug, Default, Clone)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, item: &NotificationItem) -> Result<SendReceipt, SendError> {
        info!(
            id = %item.id,
            channel = %item.channel,
            recipient = %item.recipient,
            priority = %item.priority,
            body = %item.message_body,
            "Notification delivered to log"
        );
        Ok(SendReceipt {
            provider_message_ref: Some(format!("log-{}", item.id)),
        })
    }
}
