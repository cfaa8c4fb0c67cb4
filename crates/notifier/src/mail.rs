//! Mail delivery via a Resend-style HTTP API.

use std::time::Duration;

use async_trait::async_trait;

use klaxon_common::config::AppConfig;
use klaxon_common::transport::{DeliveryReceipt, Transport, TransportError};
use klaxon_common::types::{Channel, MessagePayload, Recipient};

const DELIVER_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP mail transport.
pub struct MailTransport {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl MailTransport {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Build the transport when mail delivery is configured.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let api_key = config.mail_api_key.clone()?;
        let from = config.mail_from.clone()?;
        Some(Self::new(config.mail_api_url.clone(), api_key, from))
    }
}

fn mail_body(from: &str, recipient: &Recipient, message: &MessagePayload) -> serde_json::Value {
    serde_json::json!({
        "from": from,
        "to": [recipient.address()],
        "subject": message.title,
        "text": message.body,
    })
}

#[async_trait]
impl Transport for MailTransport {
    fn channel(&self) -> Channel {
        Channel::Mail
    }

    async fn deliver(
        &self,
        recipient: &Recipient,
        message: &MessagePayload,
    ) -> Result<DeliveryReceipt, TransportError> {
        let url = format!("{}/emails", self.api_url);
        let body = mail_body(&self.from, recipient, message);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
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

        let provider_message_id = raw.get("id").and_then(|v| v.as_str()).map(String::from);

        tracing::debug!(
            recipient = recipient.address(),
            provider_message_id = provider_message_id.as_deref().unwrap_or("none"),
            "Mail accepted by provider"
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
    use uuid::Uuid;

    #[test]
    fn test_mail_body_shape() {
        let recipient = Recipient::User {
            id: Uuid::new_v4(),
            address: "dev@example.com".to_string(),
        };
        let message = MessagePayload {
            title: "Exchange API credentials rejected".to_string(),
            body: "Binance returned 401 for key ...a1b2".to_string(),
            data: serde_json::json!({}),
        };

        let body = mail_body("Klaxon <alerts@klaxon.dev>", &recipient, &message);

        assert_eq!(body["from"], "Klaxon <alerts@klaxon.dev>");
        assert_eq!(body["to"][0], "dev@example.com");
        assert_eq!(body["subject"], "Exchange API credentials rejected");
    }
}
