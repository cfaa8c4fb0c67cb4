pub mod callbacks;
pub mod health;
pub mod notify;
pub mod rules;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(callbacks::router())
        .merge(rules::router())
        .merge(notify::router())
        .with_state(state)
}
