//! Process sandboxes
//!
//! Each sandbox is a `conveyor-sandbox` child process. Messages travel as one
//! JSON object per line: host messages on the child's stdin, envelopes on its
//! stdout. The child logs to stderr, which is inherited.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Sandbox, SandboxControl, SandboxSpawner};
use crate::error::EngineError;
use crate::rpc::{HostMessage, SandboxEnvelope, TaskChannel};

/// Environment variable carrying the sandbox id into the child
pub const SANDBOX_ID_ENV: &str = "CONVEYOR_SANDBOX_ID";
/// Environment variable enabling diagnostic handlers in the child
pub const SANDBOX_DIAGNOSTICS_ENV: &str = "CONVEYOR_SANDBOX_DIAGNOSTICS";

pub struct ProcessSpawner {
    binary: PathBuf,
    diagnostics: bool,
}

impl ProcessSpawner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            diagnostics: false,
        }
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }
}

impl SandboxSpawner for ProcessSpawner {
    fn spawn(&self, id: usize) -> Result<Sandbox, EngineError> {
        let mut command = Command::new(&self.binary);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env(SANDBOX_ID_ENV, format!("process-{id}"))
            .env(
                SANDBOX_DIAGNOSTICS_ENV,
                if self.diagnostics { "1" } else { "0" },
            )
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            EngineError::Spawn(format!("{}: {}", self.binary.display(), e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Spawn("sandbox stdin missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("sandbox stdout missing".to_string()))?;

        info!(id, pid = child.id(), binary = %self.binary.display(), "spawned process sandbox");

        let (host_tx, mut host_rx) = mpsc::unbounded_channel::<HostMessage>();
        let (sandbox_tx, sandbox_rx) = mpsc::unbounded_channel::<SandboxEnvelope>();

        let writer = tokio::spawn(async move {
            let mut stdin = BufWriter::new(stdin);
            while let Some(message) = host_rx.recv().await {
                let mut line = match serde_json::to_vec(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("failed to encode host message: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');
                if stdin.write_all(&line).await.is_err() || stdin.flush().await.is_err() {
                    debug!(id, "sandbox stdin closed");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match serde_json::from_str::<SandboxEnvelope>(&line) {
                        Ok(envelope) => {
                            if sandbox_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(id, "unparseable sandbox output: {}", e),
                    },
                    Ok(None) => {
                        debug!(id, "sandbox stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!(id, "failed to read sandbox stdout: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Sandbox::new(
            id,
            TaskChannel::new(host_tx, sandbox_rx),
            Box::new(ProcessControl {
                id,
                child,
                reader,
                writer,
            }),
        ))
    }
}

struct ProcessControl {
    id: usize,
    child: Child,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SandboxControl for ProcessControl {
    fn terminate(&mut self) {
        self.reader.abort();
        self.writer.abort();
        if let Err(e) = self.child.start_kill() {
            debug!(id = self.id, "sandbox already exited: {}", e);
        } else {
            debug!(id = self.id, "killed process sandbox");
        }
    }
}

impl Drop for ProcessControl {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
