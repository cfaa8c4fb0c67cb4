//! Admin routes for throttle rules and throttle log resets.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use klaxon_common::error::AppError;
use klaxon_common::types::{EntityRef, ThrottleRule};
use klaxon_engine::store::ThrottleStore;

use crate::middleware::auth::AdminToken;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/internal/throttle-rules", get(list_rules))
        .route("/internal/throttle-rules/{canonical}", put(upsert_rule))
        .route("/internal/throttle-logs/{canonical}", delete(reset_logs))
}

/// GET /internal/throttle-rules — List all registered throttle rules.
async fn list_rules(
    State(state): State<AppState>,
    _admin: AdminToken,
) -> Result<Json<Vec<ThrottleRule>>, AppError> {
    let rules = ThrottleStore::list_rules(&state.pool).await?;
    Ok(Json(rules))
}

#[derive(Debug, Deserialize)]
struct UpsertRuleParams {
    window_seconds: i64,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

/// PUT /internal/throttle-rules/:canonical — Create or update a throttle rule.
async fn upsert_rule(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(canonical): Path<String>,
    Json(params): Json<UpsertRuleParams>,
) -> Result<Json<ThrottleRule>, AppError> {
    if params.window_seconds < 0 {
        return Err(AppError::Validation(format!(
            "window_seconds must be non-negative, got {}",
            params.window_seconds
        )));
    }
    let rule = ThrottleStore::upsert_rule(
        &state.pool,
        &canonical,
        params.window_seconds,
        params.is_active,
    )
    .await?;
    Ok(Json(rule))
}

#[derive(Debug, Deserialize)]
struct ResetLogsParams {
    context_type: Option<String>,
    context_id: Option<String>,
}

/// DELETE /internal/throttle-logs/:canonical — Reset throttle state.
///
/// Without query parameters every context for the canonical is cleared.
/// With `context_type` and `context_id` only that one context is cleared.
async fn reset_logs(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(canonical): Path<String>,
    Query(params): Query<ResetLogsParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = match (params.context_type, params.context_id) {
        (None, None) => ThrottleStore::reset_logs(&state.pool, &canonical).await?,
        (Some(kind), Some(id)) => {
            let context = EntityRef::new(kind, id);
            u64::from(ThrottleStore::reset_log(&state.pool, &canonical, Some(&context)).await?)
        }
        _ => {
            return Err(AppError::Validation(
                "context_type and context_id must be provided together".to_string(),
            ));
        }
    };
    Ok(Json(json!({ "deleted": deleted })))
}
