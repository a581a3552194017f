//! Outbound delivery.
//!
//! A [`NotificationSender`] performs exactly one delivery attempt. Retry,
//! backoff and bookkeeping belong to the queue; the sender only classifies
//! what went wrong.

mod http;
mod log;

pub use http::{HttpSmsConfig, HttpSmsSender};
pub use log::LogSender;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::NotificationItem;

/// Acknowledgement of a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Provider-side message id, used to match later delivery receipts.
    pub provider_message_ref: Option<String>,
}

impl SendReceipt {
    pub fn with_ref(provider_message_ref: impl Into<String>) -> Self {
        Self {
            provider_message_ref: Some(provider_message_ref.into()),
        }
    }
}

/// Failure classification for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Worth retrying: network trouble, throttling, provider outage.
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Retrying cannot help: invalid number, rejected content, unsupported channel.
    #[error("terminal send failure: {0}")]
    Terminal(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Terminal(msg) => msg,
        }
    }
}

/// Pluggable delivery backend.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, item: &NotificationItem) -> std::result::Result<SendReceipt, SendError>;
}
