//! Internal dispatch route — the routing API over HTTP.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use klaxon_common::error::AppError;
use klaxon_engine::router::{DispatchOutcome, RouteRequest};

use crate::middleware::auth::AdminToken;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/internal/notifications", post(dispatch_notification))
}

/// POST /internal/notifications — Route one notification through throttling.
///
/// Returns one outcome per requested audience. Throttled and failed
/// attempts are reported inside the outcomes; only malformed requests get
/// an error status.
async fn dispatch_notification(
    State(state): State<AppState>,
    _admin: AdminToken,
    Json(request): Json<RouteRequest>,
) -> Result<Json<Vec<DispatchOutcome>>, AppError> {
    if request.audiences.is_empty() {
        return Err(AppError::Validation(
            "audiences must not be empty".to_string(),
        ));
    }
    let outcomes = state
        .router
        .route(&request)
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;
    Ok(Json(outcomes))
}
