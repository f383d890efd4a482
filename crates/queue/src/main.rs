// Conveyor queue server binary

use std::sync::Arc;

use anyhow::{Context, Result};
use conveyor_core::telemetry::{init_telemetry, TelemetryConfig};
use conveyor_queue::{router, QueueServer, QueueServerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(TelemetryConfig::from_env().with_service_name("conveyor-queue"));

    let config = QueueServerConfig::from_env()?;
    if config.worker_secret.is_none() {
        tracing::warn!("WORKER_SECRET not set, worker sockets are unauthenticated");
    }

    let server = Arc::new(QueueServer::new(config.worker_secret.clone()));
    let app = router(server);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Queue server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Queue server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
