//! Shared application state for the Axum API server.

use klaxon_common::config::AppConfig;
use klaxon_engine::router::NotificationRouter;
use redis::aio::ConnectionManager;
use sqlx::PgPool;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub redis: ConnectionManager,
    pub config: AppConfig,
    pub router: NotificationRouter,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        redis: ConnectionManager,
        config: AppConfig,
        router: NotificationRouter,
    ) -> Self {
        Self {
            pool,
            redis,
            config,
            router,
        }
    }
}
