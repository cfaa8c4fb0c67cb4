use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channels a notification can go out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Mail,
    Push,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Mail => write!(f, "mail"),
            Channel::Push => write!(f, "push"),
        }
    }
}

/// Lifecycle status of a notification log entry.
///
/// `Sent`/`Failed` are set at dispatch time; the remaining states are applied
/// later from provider delivery callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Sent,
    Failed,
    Opened,
    Delivered,
    HardBounced,
    SoftBounced,
}

/// Who a routed notification is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    User,
    Admin,
}

/// Delivery lifecycle events reported back by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventKind {
    Opened,
    Delivered,
    HardBounced,
    SoftBounced,
    Acknowledged,
}

impl DeliveryEventKind {
    /// Parse a provider event name into a known kind.
    ///
    /// Providers disagree on spelling ("open" vs "opened", "HardBounce" vs
    /// "permanent_fail") and some prefix with the channel ("email.delivered").
    /// Returns `None` for event kinds we don't track.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let name = normalized
            .rsplit('.')
            .next()
            .unwrap_or(normalized.as_str());

        match name {
            "open" | "opened" | "unique_opened" => Some(Self::Opened),
            "delivered" | "delivery" => Some(Self::Delivered),
            "bounce" | "bounced" | "hardbounce" | "hard_bounce" | "permanent_fail" => {
                Some(Self::HardBounced)
            }
            "softbounce" | "soft_bounce" | "temporary_fail" => Some(Self::SoftBounced),
            "ack" | "acknowledged" => Some(Self::Acknowledged),
            _ => None,
        }
    }
}

/// A single delivery-status update to apply to a notification log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub kind: DeliveryEventKind,
    /// When the event happened at the provider (falls back to receipt time).
    pub occurred_at: DateTime<Utc>,
    /// Raw provider payload, preserved verbatim in the audit trail.
    pub payload: serde_json::Value,
}

/// A throttle rule: how often a given canonical may fire.
///
/// `window_seconds = 0` means the canonical is never throttled.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ThrottleRule {
    pub canonical: String,
    pub window_seconds: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of the last fire for one throttle identity tuple.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ThrottleLog {
    pub canonical: String,
    pub context_type: Option<String>,
    pub context_id: Option<String>,
    pub last_fired_at: DateTime<Utc>,
}

/// Audit record for one notification dispatch attempt and its delivery lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationLog {
    pub id: Uuid,
    /// NULL for virtual recipients (e.g. the configured admin).
    pub user_id: Option<Uuid>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub canonical: String,
    pub channel: Channel,
    pub recipient: String,
    pub provider_message_id: Option<String>,
    pub status: NotificationStatus,
    pub sent_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub hard_bounced_at: Option<DateTime<Utc>>,
    pub soft_bounced_at: Option<DateTime<Utc>>,
    /// Append-only array of raw provider responses, in arrival order.
    pub gateway_response: serde_json::Value,
    pub error_message: Option<String>,
}

/// A known end user, supplied by the caller of the routing API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    /// Provider-side user key for push delivery, when the user has one.
    pub push_key: Option<String>,
}

/// A `(kind, id)` pair identifying any domain entity.
///
/// Used as the per-context half of a throttle identity (e.g. throttle per
/// user, per account) and as the subject a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Anything that can serve as a throttle context or notification subject.
pub trait Reference {
    /// Stable entity kind, e.g. "user" or "account".
    fn kind(&self) -> &'static str;

    /// Stable entity key within its kind.
    fn key(&self) -> String;

    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.key())
    }
}

impl Reference for User {
    fn kind(&self) -> &'static str {
        "user"
    }

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Resolved destination for one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Recipient {
    /// A persisted user; the audit row links back via `user_id`.
    User { id: Uuid, address: String },
    /// An address with no user record behind it (e.g. the configured admin).
    Virtual { address: String, name: String },
}

impl Recipient {
    /// The raw channel address (email address, push user key).
    pub fn address(&self) -> &str {
        match self {
            Recipient::User { address, .. } => address,
            Recipient::Virtual { address, .. } => address,
        }
    }

    /// The user id when this recipient is a persisted user.
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Recipient::User { id, .. } => Some(*id),
            Recipient::Virtual { .. } => None,
        }
    }
}

/// Human-readable notification content ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Short title (e.g., "Exchange API credentials rejected")
    pub title: String,
    /// Detailed body message
    pub body: String,
    /// Additional metadata for channel-specific formatting
    #[serde(default)]
    pub data: serde_json::Value,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::Opened => write!(f, "opened"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::HardBounced => write!(f, "hard_bounced"),
            NotificationStatus::SoftBounced => write!(f, "soft_bounced"),
        }
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Audience::User => write!(f, "user"),
            Audience::Admin => write!(f, "admin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open_aliases() {
        assert_eq!(
            DeliveryEventKind::parse("open"),
            Some(DeliveryEventKind::Opened)
        );
        assert_eq!(
            DeliveryEventKind::parse("Opened"),
            Some(DeliveryEventKind::Opened)
        );
        assert_eq!(
            DeliveryEventKind::parse("email.opened"),
            Some(DeliveryEventKind::Opened)
        );
    }

    #[test]
    fn test_parse_bounce_aliases() {
        assert_eq!(
            DeliveryEventKind::parse("HardBounce"),
            Some(DeliveryEventKind::HardBounced)
        );
        assert_eq!(
            DeliveryEventKind::parse("permanent_fail"),
            Some(DeliveryEventKind::HardBounced)
        );
        assert_eq!(
            DeliveryEventKind::parse("SoftBounce"),
            Some(DeliveryEventKind::SoftBounced)
        );
        assert_eq!(
            DeliveryEventKind::parse("temporary_fail"),
            Some(DeliveryEventKind::SoftBounced)
        );
    }

    #[test]
    fn test_parse_unknown_kind() {
        assert_eq!(DeliveryEventKind::parse("clicked"), None);
        assert_eq!(DeliveryEventKind::parse(""), None);
    }

    #[test]
    fn test_recipient_projections() {
        let id = Uuid::new_v4();
        let user = Recipient::User {
            id,
            address: "dev@example.com".to_string(),
        };
        assert_eq!(user.address(), "dev@example.com");
        assert_eq!(user.user_id(), Some(id));

        let admin = Recipient::Virtual {
            address: "ops@example.com".to_string(),
            name: "Ops".to_string(),
        };
        assert_eq!(admin.address(), "ops@example.com");
        assert_eq!(admin.user_id(), None);
    }

    #[test]
    fn test_entity_ref_from_user() {
        let user = User {
            id: Uuid::new_v4(),
            email: "dev@example.com".to_string(),
            name: None,
            push_key: None,
        };
        let entity = user.entity_ref();
        assert_eq!(entity.kind, "user");
        assert_eq!(entity.id, user.id.to_string());
    }
}
