use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Global notification kill switch (default: true)
    pub notifications_enabled: bool,

    /// Auto-create throttle rules on first use of an unknown canonical (default: true)
    pub throttle_auto_create_rules: bool,

    /// Window applied to auto-created throttle rules, in seconds (default: 3600)
    pub throttle_default_window_seconds: i64,

    /// Upper bound on row-lock waits inside the throttle transaction, in milliseconds (default: 5000)
    pub throttle_lock_timeout_ms: u64,

    /// Namespace prefix for Redis throttle and counter keys (default: "klaxon")
    pub cache_prefix: String,

    /// Shared secret for verifying delivery callback signatures
    pub webhook_signing_secret: String,

    /// Bearer token protecting the internal admin routes
    pub admin_api_token: String,

    /// Recipient address for admin-audience notifications
    pub admin_email: String,

    /// Display name for the admin recipient (default: "Klaxon Admin")
    pub admin_name: String,

    /// Mail provider API base URL (default: Resend)
    pub mail_api_url: String,

    /// Mail provider API key
    pub mail_api_key: Option<String>,

    /// Mail sender address
    pub mail_from: Option<String>,

    /// Push provider API base URL (default: Pushover)
    pub push_api_url: String,

    /// Push provider application token
    pub push_api_token: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            notifications_enabled: std::env::var("NOTIFICATIONS_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("NOTIFICATIONS_ENABLED must be true or false"))?,
            throttle_auto_create_rules: std::env::var("THROTTLE_AUTO_CREATE_RULES")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("THROTTLE_AUTO_CREATE_RULES must be true or false"))?,
            throttle_default_window_seconds: std::env::var("THROTTLE_DEFAULT_WINDOW_SECONDS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .map_err(|_| {
                    anyhow::anyhow!("THROTTLE_DEFAULT_WINDOW_SECONDS must be a valid i64")
                })?,
            throttle_lock_timeout_ms: std::env::var("THROTTLE_LOCK_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("THROTTLE_LOCK_TIMEOUT_MS must be a valid u64"))?,
            cache_prefix: std::env::var("CACHE_PREFIX").unwrap_or_else(|_| "klaxon".to_string()),
            webhook_signing_secret: std::env::var("WEBHOOK_SIGNING_SECRET").map_err(|_| {
                anyhow::anyhow!("WEBHOOK_SIGNING_SECRET environment variable is required")
            })?,
            admin_api_token: std::env::var("ADMIN_API_TOKEN")
                .map_err(|_| anyhow::anyhow!("ADMIN_API_TOKEN environment variable is required"))?,
            admin_email: std::env::var("ADMIN_EMAIL")
                .map_err(|_| anyhow::anyhow!("ADMIN_EMAIL environment variable is required"))?,
            admin_name: std::env::var("ADMIN_NAME").unwrap_or_else(|_| "Klaxon Admin".to_string()),
            mail_api_url: std::env::var("MAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            mail_api_key: std::env::var("MAIL_API_KEY").ok(),
            mail_from: std::env::var("MAIL_FROM").ok(),
            push_api_url: std::env::var("PUSH_API_URL")
                .unwrap_or_else(|_| "https://api.pushover.net/1".to_string()),
            push_api_token: std::env::var("PUSH_API_TOKEN").ok(),
        })
    }
}
