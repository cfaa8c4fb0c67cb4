//! Delivery transport abstraction.
//!
//! The router holds one `Transport` per channel and calls it after the
//! throttle decision has committed. Implementations live in the notifier
//! crate; tests substitute recording doubles.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Channel, MessagePayload, Recipient};

/// What a provider handed back for a successful delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Provider-assigned message id, used to correlate later delivery callbacks.
    pub provider_message_id: Option<String>,
    /// Raw provider response body.
    pub raw: serde_json::Value,
}

/// Errors a transport can report for one delivery attempt.
///
/// Both variants are terminal for the attempt: the router records a failed
/// audit entry and moves on. Retry policy belongs to the provider.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The provider rejected the request (non-2xx with a response).
    #[error("Provider rejected delivery: {0}")]
    Provider(String),

    /// The provider could not be reached at all.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// A delivery channel implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which channel this transport serves.
    fn channel(&self) -> Channel;

    /// Deliver one message to one recipient.
    async fn deliver(
        &self,
        recipient: &Recipient,
        message: &MessagePayload,
    ) -> Result<DeliveryReceipt, TransportError>;
}
