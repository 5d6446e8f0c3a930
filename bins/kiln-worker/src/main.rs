mod config;
mod engine;
mod evaluator;
mod executor;
mod pool;
mod sandbox;

#[cfg(test)]
mod fake;
#[cfg(test)]
mod pool_tests;

use config::PoolConfig;
use engine::DockerEngine;
use kiln_common::config::Settings;
use kiln_common::redis::{RedisJobQueue, RedisJobStore};
use kiln_common::runtime::RuntimeRegistry;
use pool::{PoolDeps, WorkerPool};
use anyhow::Context;
use sandbox::SandboxExecutor;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("KILN_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Kiln Worker booting...");

    let settings = Settings::from_env()?;

    let mut registry = RuntimeRegistry::load_or_builtin(&settings.languages_path).map_err(|e| {
        error!(path = %settings.languages_path.display(), error = %e, "Failed to load language configurations");
        e
    })?;
    if !settings.worker_languages.is_empty() {
        registry = registry.restrict_to(&settings.worker_languages);
    }
    if registry.languages().is_empty() {
        anyhow::bail!("no languages enabled for this worker");
    }
    for runtime in registry.runtimes() {
        info!(
            language = %runtime.language,
            image = %runtime.image,
            compiled = runtime.is_compiled(),
            timeout_ms = runtime.timeout_ms,
            memory_mb = runtime.memory_limit_mb,
            "Runtime enabled"
        );
    }

    let client = ::redis::Client::open(settings.redis_url.as_str())?;
    let conn = ::redis::aio::ConnectionManager::new(client.clone()).await?;
    info!(redis_url = %settings.redis_url, "Connected to Redis");

    let engine = DockerEngine::new(&settings.scratch_dir, settings.output_limit_bytes)?;
    engine.ping().await?;
    info!(scratch_dir = %settings.scratch_dir.display(), "Docker engine ready");

    // Pull every enabled image up front so no job pays for a cold pull.
    for runtime in registry.runtimes() {
        engine
            .ensure_runtime(runtime)
            .await
            .with_context(|| format!("Failed to prepare image {} for {}", runtime.image, runtime.language))?;
    }
    info!(images = registry.runtimes().count(), "Runtime images ready");

    let config = PoolConfig::from_settings(&settings, &registry);
    let deps = PoolDeps {
        store: Arc::new(RedisJobStore::new(conn.clone(), settings.result_ttl)),
        queue: Arc::new(RedisJobQueue::new(client, conn)),
        sandbox: Arc::new(engine),
        registry: Arc::new(registry),
    };
    let pool = WorkerPool::start(deps, config);
    info!(workers = pool.size(), "Worker pool running");

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    warn!("Received shutdown signal, draining in-flight jobs...");
    pool.shutdown().await;

    info!("Worker shutdown complete");
    Ok(())
}
