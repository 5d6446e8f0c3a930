mod auth;
mod error;
mod handlers;
mod metrics;
mod routes;
mod status;
mod submission;

#[cfg(test)]
mod test_support;

use axum::Router;
use kiln_common::challenge::ChallengeRepository;
use kiln_common::config::Settings;
use kiln_common::queue::JobQueue;
use kiln_common::redis::{RedisChallenges, RedisJobQueue, RedisJobStore};
use kiln_common::runtime::RuntimeRegistry;
use kiln_common::store::JobStore;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub challenges: Arc<dyn ChallengeRepository>,
    pub registry: Arc<RuntimeRegistry>,
    pub settings: Settings,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if std::env::var("KILN_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    warn!("Received shutdown signal, finishing open requests...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Kiln API booting...");

    let settings = Settings::from_env()?;
    let registry = RuntimeRegistry::load_or_builtin(&settings.languages_path)?;
    info!(languages = ?registry.languages(), "Runtime registry loaded");

    metrics::register()?;

    let client = redis::Client::open(settings.redis_url.as_str())?;
    let conn = ConnectionManager::new(client.clone()).await?;
    info!(redis_url = %settings.redis_url, "Connected to Redis");

    let bind_addr = settings.bind_addr.clone();
    let state = Arc::new(AppState {
        store: Arc::new(RedisJobStore::new(conn.clone(), settings.result_ttl)),
        queue: Arc::new(RedisJobQueue::new(client, conn.clone())),
        challenges: Arc::new(RedisChallenges::new(conn)),
        registry: Arc::new(registry),
        settings,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("HTTP server listening on {}", bind_addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API shutdown complete");
    Ok(())
}
