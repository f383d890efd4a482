//! Engine facade
//!
//! Owns the worker pool and runs plans through it, routing sandbox events to a
//! listener.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::serde_util::millis;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::{PoolConfig, SandboxMode};
use crate::error::EngineError;
use crate::lifecycle::{EngineListener, Lifecycle, RunContext};
use crate::plan::{ExecutionPlan, RunOptions};
use crate::pool::{PoolStatus, WorkerPool};
use crate::rpc::Task;
use crate::sandbox::{HandlerRegistry, ProcessSpawner, SandboxSpawner, ThreadSpawner};

/// Upper bound for the startup handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Engine {
    config: PoolConfig,
    pool: WorkerPool,
}

impl Engine {
    /// Create an engine with the sandbox kind selected by the config
    pub fn new(config: PoolConfig) -> Self {
        let spawner: Arc<dyn SandboxSpawner> = match config.mode {
            SandboxMode::Thread => {
                let mut registry = HandlerRegistry::production();
                if config.diagnostics {
                    registry = registry.with_diagnostics();
                }
                Arc::new(ThreadSpawner::new(registry))
            }
            SandboxMode::Process => Arc::new(
                ProcessSpawner::new(config.resolve_sandbox_bin())
                    .with_diagnostics(config.diagnostics),
            ),
        };
        Self::with_spawner(config, spawner)
    }

    pub fn with_spawner(config: PoolConfig, spawner: Arc<dyn SandboxSpawner>) -> Self {
        info!(
            size = config.size,
            mode = ?config.mode,
            run_timeout_ms = millis(config.run_timeout),
            "creating engine"
        );
        Self {
            pool: WorkerPool::new(config.size, spawner),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check that a sandbox starts and answers the handshake
    #[instrument(skip(self))]
    pub async fn validate(&self) -> Result<(), EngineError> {
        let result = self
            .pool
            .submit(Task::new("handshake", vec![]), HANDSHAKE_TIMEOUT, &mut |_| {})
            .await;
        match result {
            Ok(Value::Bool(true)) => Ok(()),
            Ok(other) => Err(EngineError::Protocol(format!(
                "Invalid sandbox: unexpected handshake response {other}"
            ))),
            Err(e) => {
                warn!("sandbox handshake failed: {}", e);
                Err(EngineError::Protocol(format!("Invalid sandbox: {e}")))
            }
        }
    }

    /// Run a plan to completion
    ///
    /// Resolves with the final state, including job errors recorded as data.
    /// Fails when the run itself did not resolve; the listener's `error`
    /// callback is then the last one invoked.
    #[instrument(skip_all, fields(workflow_id = %plan.id))]
    pub async fn execute(
        &self,
        plan: ExecutionPlan,
        options: RunOptions,
        listener: &dyn EngineListener,
    ) -> Result<Value, EngineError> {
        let timeout = options.timeout.unwrap_or(self.config.run_timeout);
        let plan = Arc::new(plan);

        let args = vec![
            serde_json::to_value(plan.as_ref())
                .map_err(|e| EngineError::Protocol(format!("failed to encode plan: {e}")))?,
            serde_json::to_value(&options)
                .map_err(|e| EngineError::Protocol(format!("failed to encode options: {e}")))?,
        ];

        let ctx = RunContext::new(plan, options);
        let lifecycle = Lifecycle::new(&ctx, listener);

        let result = self
            .pool
            .submit(Task::new("run", args), timeout, &mut |event| {
                lifecycle.handle(event)
            })
            .await;

        if let Err(e) = &result {
            warn!(reason = %e.reason(), "run failed: {}", e);
            lifecycle.fail(e);
        }
        result
    }

    /// Run an arbitrary registered task
    pub async fn run_task(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, EngineError> {
        self.pool
            .submit(
                Task::new(name, args),
                timeout.unwrap_or(self.config.run_timeout),
                &mut |_| {},
            )
            .await
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
