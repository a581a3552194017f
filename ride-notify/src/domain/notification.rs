//! Notification queue entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

use super::NotificationPriority;
use crate::{Error, Result};

/// Metadata key holding the source occurrence of an item.
pub const OCCURRENCE_KEY: &str = "occurrence";

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NotificationChannel {
    Sms,
    Email,
    Push,
}

/// Lifecycle state of a queued notification.
///
/// ```text
/// pending ──claim──▶ processing ──▶ sent
///    ▲                   │            │ (negative receipt)
///    └──── retry ──── failed ◀────────┘
/// pending/processing ──cancel──▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Sent,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Whether the edge `self -> next` exists in the state machine.
    ///
    /// `failed -> pending` is only taken while retry budget remains; that
    /// budget check is made by the queue, not here.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Sent, Failed)
                | (Failed, Pending)
        )
    }

    /// Validate an edge, returning `InvalidStateTransition` if it does not exist.
    pub fn transition(&self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// What produced a failure recorded in the retry history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureSource {
    /// The sender reported a transient error or timed out.
    SendFailure,
    /// The sender reported a terminal error; no retry is attempted.
    Rejected,
    /// The item sat in `processing` longer than the stale threshold.
    StaleClaim,
    /// The provider pushed a negative delivery receipt.
    Receipt,
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    /// Value of `retry_count` after this failure was recorded.
    pub attempt: u32,
    pub source: FailureSource,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub failed_at: DateTime<Utc>,
    /// When the item becomes eligible again; absent once the item is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Free-form bookkeeping carried alongside a notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationMetadata {
    /// Groups every notification produced for one ride.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Domain event kind that produced the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_history: Vec<RetryHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_ref: Option<String>,
    #[serde(default)]
    pub delivery_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_confirmed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A persisted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub id: String,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub message_body: String,
    pub priority: NotificationPriority,
    /// Not eligible before this instant. `None` means eligible immediately.
    pub scheduled_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: NotificationStatus,
    pub metadata: NotificationMetadata,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Bumped on every write; guards read-modify-write updates.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationItem {
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id.as_deref()
    }

    /// Source occurrence recorded by the producer, if any.
    pub fn occurrence(&self) -> Option<&str> {
        self.metadata.extra.get(OCCURRENCE_KEY).and_then(|v| v.as_str())
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// Input to `NotificationQueue::enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub channel: NotificationChannel,
    pub recipient: String,
    pub message_body: String,
    pub priority: NotificationPriority,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    /// At most one item per key is ever stored.
    pub dedupe_key: Option<String>,
    pub metadata: NotificationMetadata,
}

impl NewNotification {
    pub fn new(
        channel: NotificationChannel,
        recipient: impl Into<String>,
        message_body: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            recipient: recipient.into(),
            message_body: message_body.into(),
            priority: NotificationPriority::default(),
            scheduled_time: None,
            max_retries: None,
            dedupe_key: None,
            metadata: NotificationMetadata::default(),
        }
    }

    pub fn sms(recipient: impl Into<String>, message_body: impl Into<String>) -> Self {
        Self::new(NotificationChannel::Sms, recipient, message_body)
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.metadata.kind = Some(kind.into());
        self
    }

    pub fn with_occurrence(self, occurrence: impl Into<String>) -> Self {
        self.with_extra(OCCURRENCE_KEY, serde_json::Value::String(occurrence.into()))
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.recipient.trim().is_empty() {
            return Err(Error::validation("recipient must not be empty"));
        }
        if self.message_body.trim().is_empty() {
            return Err(Error::validation("message body must not be empty"));
        }
        Ok(())
    }
}
