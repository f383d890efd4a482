//! Thread sandboxes
//!
//! Each sandbox is a dedicated OS thread running the harness on its own
//! current-thread runtime. A panic unwinds the thread and closes its side of
//! the link, which the host sees as a crash. Threads cannot be killed: on
//! termination they are detached and exit once their current task ends and the
//! host side is gone.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::harness::{self, HandlerRegistry, SandboxState};
use super::{Sandbox, SandboxControl, SandboxSpawner};
use crate::error::EngineError;
use crate::rpc::TaskChannel;

pub struct ThreadSpawner {
    registry: Arc<HandlerRegistry>,
}

impl ThreadSpawner {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl SandboxSpawner for ThreadSpawner {
    fn spawn(&self, id: usize) -> Result<Sandbox, EngineError> {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (sandbox_tx, sandbox_rx) = mpsc::unbounded_channel();
        let registry = Arc::clone(&self.registry);
        let sandbox_id = format!("thread-{id}");

        let handle = std::thread::Builder::new()
            .name(format!("conveyor-sandbox-{id}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(sandbox_id = %sandbox_id, "failed to build sandbox runtime: {}", e);
                        return;
                    }
                };
                let state = Arc::new(SandboxState::new(sandbox_id));
                runtime.block_on(harness::serve(registry, state, host_rx, sandbox_tx));
            })
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        debug!(id, "spawned thread sandbox");
        Ok(Sandbox::new(
            id,
            TaskChannel::new(host_tx, sandbox_rx),
            Box::new(ThreadControl {
                id,
                handle: Some(handle),
            }),
        ))
    }
}

struct ThreadControl {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl SandboxControl for ThreadControl {
    fn terminate(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                debug!(id = self.id, "abandoning thread sandbox");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Task;
    use serde_json::json;
    use std::time::Duration;

    fn spawner() -> ThreadSpawner {
        ThreadSpawner::new(HandlerRegistry::production().with_diagnostics())
    }

    #[tokio::test]
    async fn test_thread_sandbox_runs_tasks() {
        let sandbox = spawner().spawn(7).unwrap();
        let result = sandbox
            .channel()
            .dispatch(Task::new("sandbox_id", vec![]), Duration::from_secs(5), &mut |_| {})
            .await;
        assert_eq!(result, Ok(json!("thread-7")));
        sandbox.terminate();
    }

    #[tokio::test]
    async fn test_panic_is_a_crash() {
        let sandbox = spawner().spawn(1).unwrap();
        let result = sandbox
            .channel()
            .dispatch(Task::new("panic", vec![]), Duration::from_secs(5), &mut |_| {})
            .await;
        assert!(matches!(result, Err(EngineError::Crash { .. })));
        assert!(!sandbox.channel().is_healthy());
    }
}
