//! Process sandbox entry point
//!
//! Reads host messages from stdin and writes envelopes to stdout, one JSON
//! object per line. Logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use conveyor_core::telemetry::{init_telemetry, TelemetryConfig};
use conveyor_engine::rpc::{HostMessage, SandboxEnvelope};
use conveyor_engine::sandbox::harness::{self, ExitHandler, HandlerRegistry, SandboxState};
use conveyor_engine::sandbox::process::{SANDBOX_DIAGNOSTICS_ENV, SANDBOX_ID_ENV};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_telemetry(
        TelemetryConfig::from_env()
            .with_service_name("conveyor-sandbox")
            .with_default_filter("warn")
            .with_stderr(),
    );

    let sandbox_id =
        std::env::var(SANDBOX_ID_ENV).unwrap_or_else(|_| format!("process-{}", std::process::id()));
    let diagnostics = matches!(
        std::env::var(SANDBOX_DIAGNOSTICS_ENV).as_deref(),
        Ok("1") | Ok("true")
    );

    let mut registry = HandlerRegistry::production();
    if diagnostics {
        registry = registry.with_diagnostics().with_handler(ExitHandler);
    }

    let (host_tx, host_rx) = mpsc::unbounded_channel::<HostMessage>();
    let (sandbox_tx, mut sandbox_rx) = mpsc::unbounded_channel::<SandboxEnvelope>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HostMessage>(&line) {
                Ok(message) => {
                    if host_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("ignoring malformed host message: {}", e),
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = sandbox_rx.recv().await {
            let mut line = serde_json::to_vec(&envelope).context("failed to encode envelope")?;
            line.push(b'\n');
            stdout.write_all(&line).await.context("failed to write to stdout")?;
            stdout.flush().await.context("failed to flush stdout")?;
        }
        Ok::<_, anyhow::Error>(())
    });

    harness::serve(
        Arc::new(registry),
        Arc::new(SandboxState::new(sandbox_id)),
        host_rx,
        sandbox_tx,
    )
    .await;

    writer.await.context("stdout writer panicked")??;
    Ok(())
}
