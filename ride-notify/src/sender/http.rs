//! SMS provider over HTTP.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{NotificationSender, SendError, SendReceipt};
use crate::domain::{NotificationChannel, NotificationItem};

/// SMS provider endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSmsConfig {
    /// Full URL messages are POSTed to.
    pub endpoint: String,
    /// Sent as a bearer token when present.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Sender number or alphanumeric id.
    pub from: String,
    /// URL the provider should push delivery receipts to.
    #[serde(default)]
    pub status_callback: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    15
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    to: &'a str,
    from: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_callback: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default, alias = "id", alias = "message_id")]
    sid: Option<String>,
}

/// Delivers SMS items through an HTTP provider API.
pub struct HttpSmsSender {
    config: HttpSmsConfig,
    client: Client,
}

impl HttpSmsSender {
    pub fn new(config: HttpSmsConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// 408, 425 and 429 are the provider asking us to come back later.
    fn classify_status(status: StatusCode, body: &str) -> SendError {
        let msg = format!("provider returned {status}: {body}");
        if status.is_server_error()
            || matches!(
                status,
                StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY | StatusCode::TOO_MANY_REQUESTS
            )
        {
            SendError::Transient(msg)
        } else {
            SendError::Terminal(msg)
        }
    }
}

#[async_trait]
impl NotificationSender for HttpSmsSender {
    fn name(&self) -> &'static str {
        "http-sms"
    }

    async fn send(&self, item: &NotificationItem) -> Result<SendReceipt, SendError> {
        if item.channel != NotificationChannel::Sms {
            return Err(SendError::Terminal(format!(
                "channel {} is not supported by {}",
                item.channel,
                self.name()
            )));
        }

        let payload = OutboundMessage {
            to: &item.recipient,
            from: &self.config.from,
            body: &item.message_body,
            status_callback: self.config.status_callback.as_deref(),
            reference: Some(&item.id),
        };

        let mut request = self.client.post(&self.config.endpoint).json(&payload);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("SMS request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(id = %item.id, %status, "SMS provider rejected message");
            return Err(Self::classify_status(status, &body));
        }

        // A success without a parseable body still counts as sent.
        let provider_ref = match response.json::<ProviderResponse>().await {
            Ok(body) => body.sid,
            Err(e) => {
                debug!(id = %item.id, error = %e, "SMS provider response had no message id");
                None
            }
        };

        debug!(id = %item.id, provider_ref = ?provider_ref, "SMS handed to provider");
        Ok(SendReceipt {
            provider_message_ref: provider_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(HttpSmsSender::classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(HttpSmsSender::classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!HttpSmsSender::classify_status(StatusCode::BAD_REQUEST, "bad number").is_transient());
        assert!(!HttpSmsSender::classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[test]
    fn test_config_defaults() {
        let config: HttpSmsConfig =
            serde_json::from_str(r#"{"endpoint":"http://localhost/messages","from":"+1000"}"#)
                .unwrap();
        assert_eq!(config.timeout_secs, 15);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_provider_response_aliases() {
        let parsed: ProviderResponse = serde_json::from_str(r#"{"id":"SM42"}"#).unwrap();
        assert_eq!(parsed.sid.as_deref(), Some("SM42"));
        let parsed: ProviderResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.sid, None);
    }
}
