use std::sync::Arc;

use anyhow::{Context, Result};
use conveyor_core::telemetry::{init_telemetry, TelemetryConfig};
use conveyor_engine::{Engine, PoolConfig};
use conveyor_worker::{AttemptRunner, Worker, WorkerConfig, WsTransport};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(TelemetryConfig::from_env().with_service_name("conveyor-worker"));

    let config = WorkerConfig::from_env();
    let pool_config = PoolConfig::from_env();

    tracing::info!(
        queue_url = %config.queue_url,
        worker_id = %config.worker_id,
        capacity = config.capacity,
        pool_size = pool_config.size,
        "Starting worker"
    );

    let engine = Arc::new(Engine::new(pool_config));
    engine
        .validate()
        .await
        .context("Sandbox validation failed")?;

    let transport = Arc::new(
        WsTransport::connect(config.transport())
            .await
            .context("Failed to connect to the queue server")?,
    );

    let runner = AttemptRunner::new(transport.clone(), Arc::clone(&engine))
        .with_repo_dir(config.repo_dir.clone())
        .with_timeout(config.attempt_timeout);
    let worker = Arc::new(Worker::new(config, transport.clone(), runner));

    let signal_worker = Arc::clone(&worker);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_worker.shutdown();
        }
    });

    let result = worker.run().await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Worker error");
    }

    transport.close();
    engine.shutdown();
    tracing::info!("Worker shutdown complete");
    result
}
