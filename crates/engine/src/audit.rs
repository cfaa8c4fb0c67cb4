//! Delivery audit log — one row per dispatch attempt, updated by callbacks.
//!
//! Rows are created by the router at dispatch time and mutated afterwards
//! only through `apply_event`, which applies provider delivery events
//! (opens, bounces, acknowledgments) as guarded single-statement updates.
//! The guards make replayed callbacks and racing duplicates collapse to a
//! single application without any locking.

use sqlx::PgPool;
use uuid::Uuid;

use klaxon_common::error::AppError;
use klaxon_common::types::{
    Channel, DeliveryEvent, DeliveryEventKind, EntityRef, NotificationLog, NotificationStatus,
};

/// Service layer for the notification audit trail.
pub struct AuditLog;

/// Parameters for recording one dispatch attempt.
#[derive(Debug, Clone)]
pub struct NewNotificationLog {
    pub user_id: Option<Uuid>,
    pub subject: Option<EntityRef>,
    pub canonical: String,
    pub channel: Channel,
    pub recipient: String,
    pub provider_message_id: Option<String>,
    pub status: NotificationStatus,
    /// Raw provider response from the dispatch attempt, if any.
    pub gateway_response: serde_json::Value,
    pub error_message: Option<String>,
}

impl AuditLog {
    /// Record one dispatch attempt.
    pub async fn record_dispatch(
        pool: &PgPool,
        entry: &NewNotificationLog,
    ) -> Result<NotificationLog, AppError> {
        let (subject_type, subject_id) = match &entry.subject {
            Some(subject) => (Some(subject.kind.as_str()), Some(subject.id.as_str())),
            None => (None, None),
        };

        // gateway_response is an append-only array; the dispatch response is
        // its first element.
        let initial_response = match &entry.gateway_response {
            serde_json::Value::Null => serde_json::json!([]),
            value => serde_json::json!([value]),
        };

        let log: NotificationLog = sqlx::query_as(
            r#"
            INSERT INTO notification_logs
                (id, user_id, subject_type, subject_id, canonical, channel, recipient,
                 provider_message_id, status, sent_at, gateway_response, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(subject_type)
        .bind(subject_id)
        .bind(&entry.canonical)
        .bind(entry.channel)
        .bind(&entry.recipient)
        .bind(&entry.provider_message_id)
        .bind(entry.status)
        .bind(&initial_response)
        .bind(&entry.error_message)
        .fetch_one(pool)
        .await?;

        tracing::info!(
            log_id = %log.id,
            canonical = %log.canonical,
            channel = %log.channel,
            status = %log.status,
            "Notification recorded"
        );

        Ok(log)
    }

    /// Get a single log entry by ID.
    pub async fn find_by_id(pool: &PgPool, log_id: Uuid) -> Result<NotificationLog, AppError> {
        let log: NotificationLog = sqlx::query_as("SELECT * FROM notification_logs WHERE id = $1")
            .bind(log_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification log {} not found", log_id)))?;

        Ok(log)
    }

    /// List recent log entries, optionally filtered to one user.
    pub async fn list_recent(
        pool: &PgPool,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<NotificationLog>, AppError> {
        let logs: Vec<NotificationLog> = sqlx::query_as(
            r#"
            SELECT * FROM notification_logs
            WHERE $1::uuid IS NULL OR user_id = $1
            ORDER BY sent_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(logs)
    }

    /// Find the audit row a delivery callback refers to.
    ///
    /// Providers normally echo our stored `provider_message_id`; some strip
    /// it and only identify the recipient, so we fall back to the most recent
    /// still-`sent` entry for that recipient on the channel. The primary
    /// lookup has no status filter: a second callback for the same message
    /// must find the row the first one already updated.
    pub async fn resolve_target(
        pool: &PgPool,
        provider_message_id: Option<&str>,
        recipient: Option<&str>,
        channel: Channel,
    ) -> Result<Option<NotificationLog>, AppError> {
        if let Some(message_id) = provider_message_id {
            let found: Option<NotificationLog> = sqlx::query_as(
                r#"
                SELECT * FROM notification_logs
                WHERE provider_message_id = $1 AND channel = $2
                ORDER BY sent_at DESC
                LIMIT 1
                "#,
            )
            .bind(message_id)
            .bind(channel)
            .fetch_optional(pool)
            .await?;

            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(recipient) = recipient {
            let found: Option<NotificationLog> = sqlx::query_as(
                r#"
                SELECT * FROM notification_logs
                WHERE recipient = $1 AND channel = $2 AND status = 'sent'
                ORDER BY sent_at DESC
                LIMIT 1
                "#,
            )
            .bind(recipient)
            .bind(channel)
            .fetch_optional(pool)
            .await?;

            return Ok(found);
        }

        Ok(None)
    }

    /// Apply one delivery-status event to a log row.
    ///
    /// Every transition is a guarded compare-and-set: opens and
    /// acknowledgments only land while `opened_at` is unset, bounces only
    /// while their timestamp is unset, and `delivered` only upgrades a row
    /// still in `sent`. Each applied event also appends its raw payload to
    /// `gateway_response`. Returns `false` when the guard rejected the event
    /// (replay, or a state the transition doesn't start from).
    pub async fn apply_event(
        pool: &PgPool,
        log_id: Uuid,
        event: &DeliveryEvent,
    ) -> Result<bool, AppError> {
        let record = serde_json::json!([{
            "event": event.kind,
            "occurred_at": event.occurred_at,
            "payload": event.payload,
        }]);

        let result = match event.kind {
            // Push acknowledgments are the push channel's "the human saw it"
            // signal and share the opened transition.
            DeliveryEventKind::Opened | DeliveryEventKind::Acknowledged => {
                sqlx::query(
                    r#"
                    UPDATE notification_logs
                    SET status = 'opened',
                        opened_at = $2,
                        gateway_response = gateway_response || $3::jsonb
                    WHERE id = $1 AND opened_at IS NULL
                    "#,
                )
                .bind(log_id)
                .bind(event.occurred_at)
                .bind(&record)
                .execute(pool)
                .await?
            }
            DeliveryEventKind::Delivered => {
                sqlx::query(
                    r#"
                    UPDATE notification_logs
                    SET status = 'delivered',
                        gateway_response = gateway_response || $2::jsonb
                    WHERE id = $1 AND status = 'sent'
                    "#,
                )
                .bind(log_id)
                .bind(&record)
                .execute(pool)
                .await?
            }
            DeliveryEventKind::HardBounced => {
                sqlx::query(
                    r#"
                    UPDATE notification_logs
                    SET status = 'hard_bounced',
                        hard_bounced_at = $2,
                        gateway_response = gateway_response || $3::jsonb
                    WHERE id = $1 AND hard_bounced_at IS NULL
                    "#,
                )
                .bind(log_id)
                .bind(event.occurred_at)
                .bind(&record)
                .execute(pool)
                .await?
            }
            DeliveryEventKind::SoftBounced => {
                sqlx::query(
                    r#"
                    UPDATE notification_logs
                    SET status = 'soft_bounced',
                        soft_bounced_at = $2,
                        gateway_response = gateway_response || $3::jsonb
                    WHERE id = $1 AND soft_bounced_at IS NULL
                    "#,
                )
                .bind(log_id)
                .bind(event.occurred_at)
                .bind(&record)
                .execute(pool)
                .await?
            }
        };

        let applied = result.rows_affected() > 0;
        if applied {
            tracing::info!(log_id = %log_id, event = ?event.kind, "Delivery event applied");
        } else {
            tracing::debug!(log_id = %log_id, event = ?event.kind, "Delivery event ignored (already applied)");
        }

        Ok(applied)
    }
}
