//! Notification router — audience fan-out over throttle decisions.
//!
//! One routing request can address the affected user, the admin, or both.
//! Each audience gets its own throttle decision (user windows keyed per
//! user, the admin window keyed globally under a suffixed canonical), so one
//! audience's suppression never affects the other. Delivery happens strictly
//! after the decision has committed and its locks are released; a slow
//! provider can never extend a throttle transaction.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use klaxon_common::config::AppConfig;
use klaxon_common::transport::Transport;
use klaxon_common::types::{
    Audience, Channel, EntityRef, MessagePayload, NotificationStatus, Recipient, Reference, User,
};

use crate::audit::{AuditLog, NewNotificationLog};
use crate::decision::{CacheContext, Decision, DecisionError, SkipReason, ThrottleEngine};

/// Suffix appended to the canonical for admin-audience throttling, keeping
/// the admin's global window independent of every per-user window.
const ADMIN_CANONICAL_SUFFIX: &str = "-admin";

/// One notification to route: a canonical event, a channel, and the
/// audiences it should reach.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRequest {
    pub canonical: String,
    pub audiences: Vec<Audience>,
    pub channel: Channel,
    /// The affected user; required for the user audience to be attempted.
    #[serde(default)]
    pub user: Option<User>,
    /// What the notification is about, recorded in the audit log.
    #[serde(default)]
    pub subject: Option<EntityRef>,
    pub message: MessagePayload,
    /// Per-call window override in seconds; `Some(0)` bypasses throttling.
    #[serde(default)]
    pub throttle_override: Option<i64>,
    /// When set, throttle through the Redis gate with these context pairs
    /// instead of the durable store.
    #[serde(default)]
    pub cache_context: Option<CacheContext>,
    /// Context keys the cache gate must see before deciding.
    #[serde(default)]
    pub required_context_keys: Vec<String>,
}

/// What happened for one attempted audience.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub audience: Audience,
    /// True when the decision proceeded and the transport accepted the message.
    pub dispatched: bool,
    pub skipped: Option<SkipReason>,
    pub log_id: Option<Uuid>,
    pub status: Option<NotificationStatus>,
}

impl DispatchOutcome {
    fn skipped(audience: Audience, reason: SkipReason) -> Self {
        Self {
            audience,
            dispatched: false,
            skipped: Some(reason),
            log_id: None,
            status: None,
        }
    }
}

/// Routes notifications through throttle decisions to delivery transports.
#[derive(Clone)]
pub struct NotificationRouter {
    engine: ThrottleEngine,
    pool: PgPool,
    transports: HashMap<Channel, Arc<dyn Transport>>,
    enabled: bool,
    admin_recipient: Recipient,
}

impl NotificationRouter {
    pub fn new(engine: ThrottleEngine, pool: PgPool, config: &AppConfig) -> Self {
        Self {
            engine,
            pool,
            transports: HashMap::new(),
            enabled: config.notifications_enabled,
            admin_recipient: Recipient::Virtual {
                address: config.admin_email.clone(),
                name: config.admin_name.clone(),
            },
        }
    }

    /// Register the transport for its channel.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.channel(), transport);
        self
    }

    /// Route one notification to every requested audience.
    ///
    /// Returns one outcome per requested audience, in request order. Only
    /// caller errors surface as `Err`; throttled, undeliverable and failed
    /// attempts are reported in their outcome.
    pub async fn route(&self, request: &RouteRequest) -> Result<Vec<DispatchOutcome>, DecisionError> {
        let mut outcomes = Vec::with_capacity(request.audiences.len());

        for audience in &request.audiences {
            let outcome = match audience {
                Audience::User => self.route_user(request).await?,
                Audience::Admin => self.route_admin(request).await?,
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn route_user(&self, request: &RouteRequest) -> Result<DispatchOutcome, DecisionError> {
        if !self.enabled {
            return Ok(DispatchOutcome::skipped(Audience::User, SkipReason::Disabled));
        }

        let Some(user) = &request.user else {
            tracing::warn!(
                canonical = %request.canonical,
                "User audience requested without a user, skipping"
            );
            return Ok(DispatchOutcome::skipped(Audience::User, SkipReason::NoRecipient));
        };

        // Resolve the recipient before deciding: an undeliverable attempt
        // must not consume the throttle window.
        let Some(recipient) = user_recipient(user, request.channel) else {
            tracing::warn!(
                canonical = %request.canonical,
                user_id = %user.id,
                channel = %request.channel,
                "User has no address for channel, skipping"
            );
            return Ok(DispatchOutcome::skipped(Audience::User, SkipReason::NoRecipient));
        };

        let decision = match &request.cache_context {
            Some(context) => {
                let context = context.clone().with("user", user.id.to_string());
                self.engine
                    .evaluate_cached(
                        &request.canonical,
                        &request.required_context_keys,
                        &context,
                        request.throttle_override,
                    )
                    .await?
            }
            None => {
                let entity = user.entity_ref();
                self.engine
                    .evaluate(&request.canonical, Some(&entity), request.throttle_override)
                    .await?
            }
        };

        match decision {
            Decision::Proceed => Ok(self.dispatch(Audience::User, recipient, request).await),
            Decision::Skip(reason) => Ok(DispatchOutcome::skipped(Audience::User, reason)),
        }
    }

    async fn route_admin(&self, request: &RouteRequest) -> Result<DispatchOutcome, DecisionError> {
        if !self.enabled {
            return Ok(DispatchOutcome::skipped(Audience::Admin, SkipReason::Disabled));
        }

        // The admin recipient is a mail address from configuration.
        if request.channel != Channel::Mail {
            tracing::warn!(
                canonical = %request.canonical,
                channel = %request.channel,
                "Admin audience is mail-only, skipping"
            );
            return Ok(DispatchOutcome::skipped(Audience::Admin, SkipReason::NoRecipient));
        }

        let canonical = admin_canonical(&request.canonical);

        let decision = match &request.cache_context {
            Some(context) => {
                self.engine
                    .evaluate_cached(
                        &canonical,
                        &request.required_context_keys,
                        context,
                        request.throttle_override,
                    )
                    .await?
            }
            None => {
                self.engine
                    .evaluate(&canonical, None, request.throttle_override)
                    .await?
            }
        };

        match decision {
            Decision::Proceed => {
                let recipient = self.admin_recipient.clone();
                Ok(self.dispatch(Audience::Admin, recipient, request).await)
            }
            Decision::Skip(reason) => Ok(DispatchOutcome::skipped(Audience::Admin, reason)),
        }
    }

    /// Deliver and record one attempt. The throttle decision has already
    /// committed by the time we get here, so provider latency and failures
    /// only affect this attempt's audit entry.
    async fn dispatch(
        &self,
        audience: Audience,
        recipient: Recipient,
        request: &RouteRequest,
    ) -> DispatchOutcome {
        let (status, provider_message_id, response, error_message) =
            match self.transports.get(&request.channel) {
                Some(transport) => match transport.deliver(&recipient, &request.message).await {
                    Ok(receipt) => (
                        NotificationStatus::Sent,
                        receipt.provider_message_id,
                        receipt.raw,
                        None,
                    ),
                    Err(e) => {
                        tracing::warn!(
                            canonical = %request.canonical,
                            channel = %request.channel,
                            error = %e,
                            "Delivery failed"
                        );
                        (
                            NotificationStatus::Failed,
                            None,
                            serde_json::Value::Null,
                            Some(e.to_string()),
                        )
                    }
                },
                None => {
                    tracing::error!(
                        channel = %request.channel,
                        "No transport registered for channel"
                    );
                    (
                        NotificationStatus::Failed,
                        None,
                        serde_json::Value::Null,
                        Some(format!("No transport registered for channel {}", request.channel)),
                    )
                }
            };

        let entry = NewNotificationLog {
            user_id: recipient.user_id(),
            subject: request.subject.clone(),
            canonical: request.canonical.clone(),
            channel: request.channel,
            recipient: recipient.address().to_string(),
            provider_message_id,
            status,
            gateway_response: response,
            error_message,
        };

        let dispatched = status == NotificationStatus::Sent;

        match AuditLog::record_dispatch(&self.pool, &entry).await {
            Ok(log) => DispatchOutcome {
                audience,
                dispatched,
                skipped: None,
                log_id: Some(log.id),
                status: Some(status),
            },
            Err(e) => {
                // The notification may already be out; losing the audit row
                // must not turn a delivered notification into an error.
                tracing::error!(
                    canonical = %request.canonical,
                    error = %e,
                    "Failed to record notification log"
                );
                DispatchOutcome {
                    audience,
                    dispatched,
                    skipped: None,
                    log_id: None,
                    status: Some(status),
                }
            }
        }
    }
}

fn admin_canonical(canonical: &str) -> String {
    format!("{}{}", canonical, ADMIN_CANONICAL_SUFFIX)
}

fn user_recipient(user: &User, channel: Channel) -> Option<Recipient> {
    let address = match channel {
        Channel::Mail => Some(user.email.clone()),
        Channel::Push => user.push_key.clone(),
    }?;

    Some(Recipient::User {
        id: user.id,
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_user(push_key: Option<&str>) -> User {
        User {
            id: Uuid::new_v4(),
            email: "dev@example.com".to_string(),
            name: Some("Dev".to_string()),
            push_key: push_key.map(|k| k.to_string()),
        }
    }

    #[test]
    fn test_admin_canonical_suffix() {
        assert_eq!(admin_canonical("api_error"), "api_error-admin");
    }

    #[test]
    fn test_user_recipient_mail() {
        let user = make_user(None);
        let recipient = user_recipient(&user, Channel::Mail).unwrap();
        assert_eq!(recipient.address(), "dev@example.com");
        assert_eq!(recipient.user_id(), Some(user.id));
    }

    #[test]
    fn test_user_recipient_push_requires_key() {
        let user = make_user(None);
        assert!(user_recipient(&user, Channel::Push).is_none());

        let user = make_user(Some("po-key-123"));
        let recipient = user_recipient(&user, Channel::Push).unwrap();
        assert_eq!(recipient.address(), "po-key-123");
    }
}
