//! Provider delivery receipts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum::Display;

/// Message status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderStatus {
    Accepted,
    Scheduled,
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    Undelivered,
    Failed,
    #[serde(alias = "cancelled")]
    Canceled,
    /// Any status this service does not know.
    #[serde(other)]
    Unknown,
}

impl ProviderStatus {
    pub const fn classify(self) -> ReceiptStatus {
        match self {
            Self::Delivered | Self::Read => ReceiptStatus::Delivered,
            Self::Accepted | Self::Scheduled | Self::Queued | Self::Sending | Self::Sent => {
                ReceiptStatus::InFlight
            }
            Self::Undelivered | Self::Failed | Self::Canceled => ReceiptStatus::Failed,
            Self::Unknown => ReceiptStatus::Unknown,
        }
    }
}

/// Asynchronous delivery report pushed by the SMS provider.
///
/// Field aliases accept the provider's native callback field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    #[serde(default, alias = "MessageSid", alias = "sid")]
    pub provider_message_ref: Option<String>,
    #[serde(alias = "MessageStatus")]
    pub status: ProviderStatus,
    #[serde(
        default,
        alias = "ErrorCode",
        deserialize_with = "deserialize_error_code"
    )]
    pub error_code: Option<String>,
    #[serde(default, alias = "ErrorMessage")]
    pub error_message: Option<String>,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

/// What a provider status means for the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Handset confirmed delivery.
    Delivered,
    /// Provider accepted the message but delivery is not yet known.
    InFlight,
    /// Provider gave up on the message.
    Failed,
    /// Status not recognised.
    Unknown,
}

impl DeliveryReceipt {
    pub fn new(provider_message_ref: impl Into<String>, status: ProviderStatus) -> Self {
        Self {
            provider_message_ref: Some(provider_message_ref.into()),
            status,
            error_code: None,
            error_message: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn classify(&self) -> ReceiptStatus {
        self.status.classify()
    }

    /// Human readable failure reason for the retry history.
    pub fn failure_reason(&self) -> String {
        match (&self.error_message, &self.error_code) {
            (Some(msg), _) => msg.clone(),
            (None, Some(code)) => format!("provider reported {} (error {})", self.status, code),
            (None, None) => format!("provider reported {}", self.status),
        }
    }
}

/// Providers send error codes either as strings or numbers.
fn deserialize_error_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Text(String),
        Number(i64),
    }

    Ok(match Option::<Code>::deserialize(deserializer)? {
        Some(Code::Text(s)) if s.trim().is_empty() => None,
        Some(Code::Text(s)) => Some(s),
        Some(Code::Number(n)) => Some(n.to_string()),
        None => None,
    })
}
