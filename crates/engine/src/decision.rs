//! Throttle decision engine.
//!
//! Answers one question: may the notification identified by `canonical` (plus
//! an optional context) fire right now? Two strategies share the same policy
//! layer:
//!
//! 1. Durable (`evaluate`/`decide`): row-locked state in `throttle_logs`,
//!    survives restarts, supports per-context windows.
//! 2. Cache (`evaluate_cached`/`decide_cached`): a Redis `SET NX EX` marker
//!    under a key derived from the canonical and sorted context pairs.
//!
//! Error policy: invalid caller input (negative override, missing required
//! context keys) is a `DecisionError`. Operational failure (store down, lock
//! timeout) is never an error to the caller; the decision fails closed and
//! the notification is suppressed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

use klaxon_common::config::AppConfig;
use klaxon_common::error::AppError;
use klaxon_common::types::EntityRef;

use crate::cache::CacheGate;
use crate::store::{FireAttempt, ThrottleStore};

/// Outcome of a throttle decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Skip(SkipReason),
}

impl Decision {
    pub fn should_proceed(&self) -> bool {
        matches!(self, Decision::Proceed)
    }
}

/// Why a decision declined to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An earlier fire's window is still open.
    WithinWindow,
    /// No rule exists for the canonical and auto-creation is off.
    UnknownCanonical,
    /// The rule exists but has been switched off.
    RuleInactive,
    /// Gave up waiting for a competing decision's row lock.
    LockTimeout,
    /// The backing store could not be reached or errored.
    StoreUnavailable,
    /// Notifications are globally disabled.
    Disabled,
    /// No deliverable recipient for the requested audience and channel.
    NoRecipient,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::WithinWindow => write!(f, "within_window"),
            SkipReason::UnknownCanonical => write!(f, "unknown_canonical"),
            SkipReason::RuleInactive => write!(f, "rule_inactive"),
            SkipReason::LockTimeout => write!(f, "lock_timeout"),
            SkipReason::StoreUnavailable => write!(f, "store_unavailable"),
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::NoRecipient => write!(f, "no_recipient"),
        }
    }
}

/// Caller errors. These mean the call site is wrong, not that the
/// notification should be silently dropped.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Throttle window override must be non-negative, got {0}")]
    NegativeWindow(i64),

    #[error("Cache throttle for '{canonical}' is missing required context keys: {}", missing.join(", "))]
    MissingContextKeys {
        canonical: String,
        missing: Vec<String>,
    },
}

/// Ordered context pairs for cache-mode throttling.
///
/// Pairs are held sorted by key so the derived Redis key does not depend on
/// insertion order. Serializes as a flat string map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheContext {
    pairs: BTreeMap<String, String>,
}

impl CacheContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.pairs.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Throttle decision engine over the durable store and the cache gate.
#[derive(Clone)]
pub struct ThrottleEngine {
    pool: PgPool,
    cache: CacheGate,
    auto_create_rules: bool,
    default_window_seconds: i64,
    lock_timeout_ms: u64,
}

enum WindowResolution {
    Window(i64),
    Skip(SkipReason),
}

impl ThrottleEngine {
    pub fn new(pool: PgPool, cache: CacheGate, config: &AppConfig) -> Self {
        Self {
            pool,
            cache,
            auto_create_rules: config.throttle_auto_create_rules,
            default_window_seconds: config.throttle_default_window_seconds,
            lock_timeout_ms: config.throttle_lock_timeout_ms,
        }
    }

    /// Durable throttle decision: `true` means fire, `false` means skip.
    pub async fn decide(
        &self,
        canonical: &str,
        context: Option<&EntityRef>,
        window_override: Option<i64>,
    ) -> Result<bool, DecisionError> {
        Ok(self
            .evaluate(canonical, context, window_override)
            .await?
            .should_proceed())
    }

    /// Durable throttle decision with the skip reason preserved.
    pub async fn evaluate(
        &self,
        canonical: &str,
        context: Option<&EntityRef>,
        window_override: Option<i64>,
    ) -> Result<Decision, DecisionError> {
        validate_override(window_override)?;

        let window = match self.resolve_window(canonical, window_override).await {
            Ok(WindowResolution::Window(window)) => window,
            Ok(WindowResolution::Skip(reason)) => return Ok(Decision::Skip(reason)),
            Err(e) => {
                tracing::error!(canonical, error = %e, "Throttle rule lookup failed, suppressing notification");
                return Ok(Decision::Skip(SkipReason::StoreUnavailable));
            }
        };

        // Zero window: always fire, and leave no log row behind.
        if window == 0 {
            return Ok(Decision::Proceed);
        }

        let attempt = ThrottleStore::try_fire(
            &self.pool,
            canonical,
            context,
            window,
            self.lock_timeout_ms,
        )
        .await;

        match attempt {
            Ok(FireAttempt::Fired) => Ok(Decision::Proceed),
            Ok(FireAttempt::WithinWindow) => {
                tracing::debug!(canonical, "Notification suppressed, window still open");
                Ok(Decision::Skip(SkipReason::WithinWindow))
            }
            Ok(FireAttempt::LockTimeout) => {
                tracing::warn!(
                    canonical,
                    lock_timeout_ms = self.lock_timeout_ms,
                    "Timed out waiting for a competing throttle decision, suppressing notification"
                );
                Ok(Decision::Skip(SkipReason::LockTimeout))
            }
            Err(e) => {
                tracing::error!(canonical, error = %e, "Throttle store unavailable, suppressing notification");
                Ok(Decision::Skip(SkipReason::StoreUnavailable))
            }
        }
    }

    /// Cache throttle decision: `true` means fire, `false` means skip.
    pub async fn decide_cached(
        &self,
        canonical: &str,
        required_keys: &[String],
        context: &CacheContext,
        window_override: Option<i64>,
    ) -> Result<bool, DecisionError> {
        Ok(self
            .evaluate_cached(canonical, required_keys, context, window_override)
            .await?
            .should_proceed())
    }

    /// Cache throttle decision with the skip reason preserved.
    ///
    /// The window still comes from `throttle_rules`; only the fire state
    /// lives in Redis, where the key's TTL is the window boundary.
    pub async fn evaluate_cached(
        &self,
        canonical: &str,
        required_keys: &[String],
        context: &CacheContext,
        window_override: Option<i64>,
    ) -> Result<Decision, DecisionError> {
        validate_override(window_override)?;

        let missing = missing_keys(required_keys, context);
        if !missing.is_empty() {
            return Err(DecisionError::MissingContextKeys {
                canonical: canonical.to_string(),
                missing,
            });
        }

        let window = match self.resolve_window(canonical, window_override).await {
            Ok(WindowResolution::Window(window)) => window,
            Ok(WindowResolution::Skip(reason)) => return Ok(Decision::Skip(reason)),
            Err(e) => {
                tracing::error!(canonical, error = %e, "Throttle rule lookup failed, suppressing notification");
                return Ok(Decision::Skip(SkipReason::StoreUnavailable));
            }
        };

        if window == 0 {
            return Ok(Decision::Proceed);
        }

        let key = self.cache.throttle_key(&derive_cache_key(canonical, context));

        match self.cache.set_if_absent(&key, window).await {
            Ok(true) => Ok(Decision::Proceed),
            Ok(false) => {
                tracing::debug!(canonical, key = %key, "Notification suppressed, cache window still open");
                Ok(Decision::Skip(SkipReason::WithinWindow))
            }
            Err(e) => {
                tracing::error!(canonical, error = %e, "Cache gate unavailable, suppressing notification");
                Ok(Decision::Skip(SkipReason::StoreUnavailable))
            }
        }
    }

    /// Resolve the effective window for a canonical.
    ///
    /// Rule resolution runs before any zero-window shortcut: an override on
    /// an unregistered canonical still fails closed when auto-creation is
    /// off. Overrides tune a known rule's window, they do not bypass
    /// registration.
    async fn resolve_window(
        &self,
        canonical: &str,
        window_override: Option<i64>,
    ) -> Result<WindowResolution, AppError> {
        let rule = match ThrottleStore::find_rule(&self.pool, canonical).await? {
            Some(rule) => rule,
            None if self.auto_create_rules => {
                ThrottleStore::create_rule_if_absent(
                    &self.pool,
                    canonical,
                    self.default_window_seconds,
                )
                .await?
            }
            None => {
                tracing::warn!(canonical, "No throttle rule for canonical, suppressing notification");
                return Ok(WindowResolution::Skip(SkipReason::UnknownCanonical));
            }
        };

        if !rule.is_active {
            tracing::debug!(canonical, "Throttle rule inactive, suppressing notification");
            return Ok(WindowResolution::Skip(SkipReason::RuleInactive));
        }

        Ok(WindowResolution::Window(
            window_override.unwrap_or(rule.window_seconds),
        ))
    }
}

fn validate_override(window_override: Option<i64>) -> Result<(), DecisionError> {
    if let Some(window) = window_override
        && window < 0
    {
        return Err(DecisionError::NegativeWindow(window));
    }
    Ok(())
}

fn missing_keys(required_keys: &[String], context: &CacheContext) -> Vec<String> {
    required_keys
        .iter()
        .filter(|key| !context.contains_key(key))
        .cloned()
        .collect()
}

/// Derive the deterministic cache key body for a canonical + context.
///
/// `"y"` with `{api: "binance"}` derives `"y-api:binance"`; pairs are
/// appended in key order.
fn derive_cache_key(canonical: &str, context: &CacheContext) -> String {
    let mut key = String::from(canonical);
    for (name, value) in &context.pairs {
        key.push('-');
        key.push_str(name);
        key.push(':');
        key.push_str(value);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_cache_key_single_pair() {
        let context = CacheContext::new().with("api", "binance");
        assert_eq!(derive_cache_key("y", &context), "y-api:binance");
    }

    #[test]
    fn test_derive_cache_key_sorts_pairs() {
        let context = CacheContext::new()
            .with("venue", "nyse")
            .with("api", "binance");
        let reordered = CacheContext::new()
            .with("api", "binance")
            .with("venue", "nyse");

        assert_eq!(
            derive_cache_key("feed_stale", &context),
            "feed_stale-api:binance-venue:nyse"
        );
        assert_eq!(
            derive_cache_key("feed_stale", &context),
            derive_cache_key("feed_stale", &reordered)
        );
    }

    #[test]
    fn test_derive_cache_key_empty_context() {
        assert_eq!(derive_cache_key("y", &CacheContext::new()), "y");
    }

    #[test]
    fn test_validate_override() {
        assert!(validate_override(None).is_ok());
        assert!(validate_override(Some(0)).is_ok());
        assert!(validate_override(Some(300)).is_ok());
        assert!(matches!(
            validate_override(Some(-1)),
            Err(DecisionError::NegativeWindow(-1))
        ));
    }

    #[test]
    fn test_missing_keys() {
        let required = vec!["api".to_string(), "venue".to_string()];
        let context = CacheContext::new().with("api", "binance");

        assert_eq!(missing_keys(&required, &context), vec!["venue".to_string()]);
        assert!(missing_keys(&[], &context).is_empty());
    }
}
