//! Klaxon API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use klaxon_common::config::AppConfig;
use klaxon_common::db::{create_pool, run_migrations};
use klaxon_common::redis_pool::create_redis_pool;
use klaxon_engine::cache::CacheGate;
use klaxon_engine::decision::ThrottleEngine;
use klaxon_engine::router::NotificationRouter;
use klaxon_notifier::{MailTransport, PushTransport};

use klaxon_api::routes::create_router;
use klaxon_api::state::AppState;

/// Largest request body the API will buffer (covers callback batches).
const MAX_BODY_BYTES: usize = 256 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("klaxon_api=debug,klaxon_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Klaxon API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool and apply migrations
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    // Create Redis connection
    let redis = create_redis_pool(&config.redis_url).await?;

    // Build the throttle engine and notification router
    let cache = CacheGate::new(redis.clone(), config.cache_prefix.clone());
    let engine = ThrottleEngine::new(pool.clone(), cache, &config);
    let mut router = NotificationRouter::new(engine, pool.clone(), &config);

    if let Some(mail) = MailTransport::from_config(&config) {
        router = router.with_transport(Arc::new(mail));
        tracing::info!("Mail transport registered");
    } else {
        tracing::warn!("Mail transport not configured (MAIL_API_KEY / MAIL_FROM unset)");
    }

    if let Some(push) = PushTransport::from_config(&config) {
        router = router.with_transport(Arc::new(push));
        tracing::info!("Push transport registered");
    } else {
        tracing::warn!("Push transport not configured (PUSH_API_TOKEN unset)");
    }

    // Build application state
    let state = AppState::new(pool, redis, config, router);

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Klaxon API server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Received shutdown signal, stopping gracefully...");
}
