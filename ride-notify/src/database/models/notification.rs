//! Notification queue database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_ms_to_datetime};
use crate::domain::{
    NewNotification, NotificationChannel, NotificationItem, NotificationMetadata,
    NotificationPriority, NotificationStatus,
};
use crate::{Error, Result};

/// Row of the `notification_item` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationItemDbModel {
    pub id: String,
    pub channel: String,
    pub recipient: String,
    pub message_body: String,
    /// Numeric rank, see [`NotificationPriority::rank`].
    pub priority: i64,
    /// Unix epoch milliseconds.
    pub scheduled_at: Option<i64>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub status: String,
    pub correlation_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub provider_message_ref: Option<String>,
    /// JSON encoded [`NotificationMetadata`].
    pub metadata: String,
    pub last_error: Option<String>,
    pub claimed_at: Option<i64>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationItemDbModel {
    /// Build a fresh `pending` row.
    pub fn from_new(new: &NewNotification, default_max_retries: u32, now_ms: i64) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: new.channel.to_string(),
            recipient: new.recipient.clone(),
            message_body: new.message_body.clone(),
            priority: new.priority.rank(),
            scheduled_at: new.scheduled_time.map(datetime_to_ms),
            retry_count: 0,
            max_retries: i64::from(new.max_retries.unwrap_or(default_max_retries)),
            status: NotificationStatus::Pending.as_str().to_string(),
            correlation_id: new.metadata.correlation_id.clone(),
            dedupe_key: new.dedupe_key.clone(),
            provider_message_ref: None,
            metadata: serde_json::to_string(&new.metadata)?,
            last_error: None,
            claimed_at: None,
            version: 0,
            created_at: now_ms,
            updated_at: now_ms,
        })
    }

    /// Row image of a domain item. Indexed columns are derived from metadata.
    pub fn from_domain(item: &NotificationItem) -> Result<Self> {
        Ok(Self {
            id: item.id.clone(),
            channel: item.channel.to_string(),
            recipient: item.recipient.clone(),
            message_body: item.message_body.clone(),
            priority: item.priority.rank(),
            scheduled_at: item.scheduled_time.map(datetime_to_ms),
            retry_count: i64::from(item.retry_count),
            max_retries: i64::from(item.max_retries),
            status: item.status.as_str().to_string(),
            correlation_id: item.metadata.correlation_id.clone(),
            dedupe_key: None,
            provider_message_ref: item.metadata.provider_message_ref.clone(),
            metadata: serde_json::to_string(&item.metadata)?,
            last_error: item.last_error.clone(),
            claimed_at: item.claimed_at.map(datetime_to_ms),
            version: item.version,
            created_at: datetime_to_ms(item.created_at),
            updated_at: datetime_to_ms(item.updated_at),
        })
    }

    pub fn into_domain(self) -> Result<NotificationItem> {
        let channel = self.channel.parse::<NotificationChannel>().map_err(|_| {
            Error::validation(format!("unknown channel '{}' on {}", self.channel, self.id))
        })?;
        let status = NotificationStatus::parse(&self.status).ok_or_else(|| {
            Error::validation(format!("unknown status '{}' on {}", self.status, self.id))
        })?;
        let priority = NotificationPriority::from_rank(self.priority).ok_or_else(|| {
            Error::validation(format!("unknown priority {} on {}", self.priority, self.id))
        })?;
        let metadata: NotificationMetadata = serde_json::from_str(&self.metadata)?;

        Ok(NotificationItem {
            id: self.id,
            channel,
            recipient: self.recipient,
            message_body: self.message_body,
            priority,
            scheduled_time: opt_ms_to_datetime(self.scheduled_at),
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            max_retries: u32::try_from(self.max_retries).unwrap_or(0),
            status,
            metadata,
            last_error: self.last_error,
            claimed_at: opt_ms_to_datetime(self.claimed_at),
            version: self.version,
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
        })
    }
}

/// Item count per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: NotificationStatus, count: u64) {
        match status {
            NotificationStatus::Pending => self.pending += count,
            NotificationStatus::Processing => self.processing += count,
            NotificationStatus::Sent => self.sent += count,
            NotificationStatus::Failed => self.failed += count,
            NotificationStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed + self.cancelled
    }

    /// Items that still need dispatcher attention.
    pub fn active(&self) -> u64 {
        self.pending + self.processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_row_round_trips_to_domain() {
        let new = NewNotification::sms("+15550001", "Your driver is on the way")
            .with_priority(NotificationPriority::High)
            .with_correlation_id("ride-1")
            .with_dedupe_key("ride-1:driver_en_route:+15550001");
        let row = NotificationItemDbModel::from_new(&new, 3, 1_000).unwrap();
        assert_eq!(row.priority, 3);
        assert_eq!(row.correlation_id.as_deref(), Some("ride-1"));

        let item = row.into_domain().unwrap();
        assert_eq!(item.status, NotificationStatus::Pending);
        assert_eq!(item.priority, NotificationPriority::High);
        assert_eq!(item.max_retries, 3);
        assert_eq!(item.correlation_id(), Some("ride-1"));
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let new = NewNotification::sms("+15550001", "hello");
        let mut row = NotificationItemDbModel::from_new(&new, 3, 0).unwrap();
        row.status = "exploded".to_string();
        assert!(row.into_domain().is_err());
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        counts.add(NotificationStatus::Pending, 2);
        counts.add(NotificationStatus::Sent, 5);
        assert_eq!(counts.total(), 7);
        assert_eq!(counts.active(), 2);
    }
}
