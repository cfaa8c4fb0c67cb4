//! Delivery callback routes — gateway webhooks and push acknowledgments.
//!
//! The mail gateway posts signed event batches to `/callbacks/delivery`;
//! the push gateway confirms receipt acknowledgments with a form post to
//! `/callbacks/acknowledgment`. Both feed the notification audit log.

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::FormRejection;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

use klaxon_common::error::AppError;
use klaxon_common::types::{Channel, DeliveryEvent, DeliveryEventKind};
use klaxon_engine::audit::AuditLog;

use crate::middleware::auth::constant_time_eq;
use crate::state::AppState;

/// Header carrying the hex-encoded HMAC-SHA256 of the raw request body.
const SIGNATURE_HEADER: &str = "x-klaxon-signature";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/callbacks/delivery", post(delivery_callback))
        .route("/callbacks/acknowledgment", post(acknowledgment_callback))
}

/// One event in a gateway batch. Unknown fields are preserved verbatim in
/// the audit trail via the serialized payload.
#[derive(Debug, Serialize, Deserialize)]
struct DeliveryEventPayload {
    event: String,
    #[serde(default)]
    provider_message_id: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default = "default_channel")]
    channel: Channel,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn default_channel() -> Channel {
    Channel::Mail
}

#[derive(Debug, Deserialize)]
struct DeliveryBatch {
    events: Vec<DeliveryEventPayload>,
}

/// POST /callbacks/delivery — Ingest signed delivery events from the mail gateway.
///
/// The signature is checked against the raw body before anything is parsed.
/// Past that check the response is always success-shaped: events that cannot
/// be parsed, matched, or recorded are logged and counted as ignored rather
/// than failing the batch, since the gateway retries anything but 2xx.
async fn delivery_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Auth(format!("Missing {} header", SIGNATURE_HEADER)))?;

    if !verify_signature(&body, signature, &state.config.webhook_signing_secret) {
        return Err(AppError::Auth("Invalid webhook signature".to_string()));
    }

    let batch: DeliveryBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(err) => {
            tracing::warn!(error = %err, "Discarding malformed delivery payload");
            return Ok(Json(json!({ "accepted": 0, "ignored": 0 })));
        }
    };

    let mut accepted = 0u64;
    let mut ignored = 0u64;
    for event in &batch.events {
        match apply_delivery_event(&state, event).await {
            Ok(true) => accepted += 1,
            Ok(false) => ignored += 1,
            Err(err) => {
                tracing::warn!(
                    event = %event.event,
                    error = %err,
                    "Failed to apply delivery event"
                );
                ignored += 1;
            }
        }
    }

    tracing::info!(accepted, ignored, "Processed delivery callback batch");
    Ok(Json(json!({ "accepted": accepted, "ignored": ignored })))
}

/// Apply a single gateway event. Returns false when the event kind is
/// unrecognized or no notification matches, true when an audit row changed.
async fn apply_delivery_event(
    state: &AppState,
    payload: &DeliveryEventPayload,
) -> Result<bool, AppError> {
    let Some(kind) = DeliveryEventKind::parse(&payload.event) else {
        tracing::debug!(event = %payload.event, "Ignoring unrecognized delivery event");
        return Ok(false);
    };

    let target = AuditLog::resolve_target(
        &state.pool,
        payload.provider_message_id.as_deref(),
        payload.recipient.as_deref(),
        payload.channel,
    )
    .await?;
    let Some(log) = target else {
        tracing::warn!(
            event = %payload.event,
            provider_message_id = ?payload.provider_message_id,
            recipient = ?payload.recipient,
            "Delivery event matched no notification"
        );
        return Ok(false);
    };

    let event = DeliveryEvent {
        kind,
        occurred_at: payload.timestamp.unwrap_or_else(Utc::now),
        payload: serde_json::to_value(payload).unwrap_or_default(),
    };
    AuditLog::apply_event(&state.pool, log.id, &event).await
}

#[derive(Debug, Deserialize)]
struct AcknowledgmentPayload {
    receipt: String,
    #[serde(default)]
    acknowledged_at: Option<i64>,
    #[serde(default)]
    acknowledged_by: Option<String>,
}

/// POST /callbacks/acknowledgment — Record a push acknowledgment.
///
/// The push gateway posts form data keyed by the receipt it returned at
/// dispatch time. Always answers 200: malformed forms, unknown receipts,
/// and store failures alike come back as `applied: false` (logged), so the
/// gateway stops resending them.
async fn acknowledgment_callback(
    State(state): State<AppState>,
    payload: Result<Form<AcknowledgmentPayload>, FormRejection>,
) -> Json<serde_json::Value> {
    let Form(payload) = match payload {
        Ok(form) => form,
        Err(err) => {
            tracing::warn!(error = %err, "Discarding malformed acknowledgment");
            return Json(json!({ "status": "ok", "applied": false }));
        }
    };

    let target =
        match AuditLog::resolve_target(&state.pool, Some(&payload.receipt), None, Channel::Push)
            .await
        {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(
                    receipt = %payload.receipt,
                    error = %err,
                    "Failed to resolve acknowledgment"
                );
                return Json(json!({ "status": "ok", "applied": false }));
            }
        };
    let Some(log) = target else {
        tracing::warn!(receipt = %payload.receipt, "Acknowledgment matched no notification");
        return Json(json!({ "status": "ok", "applied": false }));
    };

    let occurred_at = payload
        .acknowledged_at
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);
    let event = DeliveryEvent {
        kind: DeliveryEventKind::Acknowledged,
        occurred_at,
        payload: json!({
            "receipt": payload.receipt,
            "acknowledged_by": payload.acknowledged_by,
        }),
    };
    let applied = match AuditLog::apply_event(&state.pool, log.id, &event).await {
        Ok(applied) => applied,
        Err(err) => {
            tracing::warn!(
                receipt = %payload.receipt,
                error = %err,
                "Failed to record acknowledgment"
            );
            false
        }
    };
    Json(json!({ "status": "ok", "applied": applied }))
}

/// Check a hex-encoded HMAC-SHA256 signature over the raw request body.
fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    type HmacSha256 = Hmac<Sha256>;
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    let provided = signature.trim().to_ascii_lowercase();
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"events":[]}"#;
        let sig = sign(body, "secret");
        assert!(verify_signature(body, &sig, "secret"));
    }

    #[test]
    fn accepts_uppercase_hex() {
        let body = br#"{"events":[]}"#;
        let sig = sign(body, "secret").to_ascii_uppercase();
        assert!(verify_signature(body, &sig, "secret"));
    }

    #[test]
    fn rejects_tampered_body() {
        let sig = sign(br#"{"events":[]}"#, "secret");
        assert!(!verify_signature(br#"{"events":[{}]}"#, &sig, "secret"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = br#"{"events":[]}"#;
        let sig = sign(body, "secret");
        assert!(!verify_signature(body, &sig, "other"));
    }
}
