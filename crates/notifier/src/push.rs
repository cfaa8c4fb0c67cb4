//! Push delivery via a Pushover-style HTTP API.

use std::time::Duration;

use async_trait::async_trait;

use klaxon_common::config::AppConfig;
use klaxon_common::transport::{DeliveryReceipt, Transport, TransportError};
use klaxon_common::types::{Channel, MessagePayload, Recipient};

const DELIVER_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP push transport. The recipient address is the provider-side user key.
pub struct PushTransport {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl PushTransport {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            token: token.into(),
        }
    }

    /// Build the transport when push delivery is configured.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let token = config.push_api_token.clone()?;
        Some(Self::new(config.push_api_url.clone(), token))
    }
}

/// Pushover hands back a `receipt` for acknowledgeable messages and a
/// `request` id otherwise; either correlates later callbacks.
fn receipt_id(raw: &serde_json::Value) -> Option<String> {
    raw.get("receipt")
        .or_else(|| raw.get("request"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[async_trait]
impl Transport for PushTransport {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn deliver(
        &self,
        recipient: &Recipient,
        message: &MessagePayload,
    ) -> Result<DeliveryReceipt, TransportError> {
        let url = format!("{}/messages.json", self.api_url);
        let form = [
            ("token", self.token.as_str()),
            ("user", recipient.address()),
            ("title", message.title.as_str()),
            ("message", message.body.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .form(&form)
            .timeout(DELIVER_TIMEOUT)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Provider(e.to_string()))?;
        let raw: serde_json::Value =
            serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({ "raw": text }));

        if !status.is_success() {
            return Err(TransportError::Provider(format!("{}: {}", status, raw)));
        }

        let provider_message_id = receipt_id(&raw);

        tracing::debug!(
            provider_message_id = provider_message_id.as_deref().unwrap_or("none"),
            "Push accepted by provider"
        );

        Ok(DeliveryReceipt {
            provider_message_id,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_id_prefers_receipt() {
        let raw = serde_json::json!({"status": 1, "receipt": "r-123", "request": "q-456"});
        assert_eq!(receipt_id(&raw), Some("r-123".to_string()));
    }

    #[test]
    fn test_receipt_id_falls_back_to_request() {
        let raw = serde_json::json!({"status": 1, "request": "q-456"});
        assert_eq!(receipt_id(&raw), Some("q-456".to_string()));
    }

    #[test]
    fn test_receipt_id_absent() {
        assert_eq!(receipt_id(&serde_json::json!({"status": 1})), None);
    }
}
