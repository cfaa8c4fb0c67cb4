use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager for async operations.
///
/// Pings once before returning so a bad `REDIS_URL` fails at startup instead
/// of on the first throttle decision.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    redis::cmd("PING").query_async::<()>(&mut manager).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
