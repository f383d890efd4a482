//! Sandbox harness
//!
//! The code that runs *inside* a sandbox: a fixed registry of named task
//! handlers and the serve loop that executes one task at a time. Thread
//! sandboxes run it on their own runtime; process sandboxes run it from the
//! `conveyor-sandbox` binary with stdio bridged to the channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::WorkerEvent;
use crate::rpc::{HostMessage, SandboxEnvelope, SandboxMessage, TaskError};
use crate::sandbox::runtime::RunHandler;

// ============================================================================
// Sandbox-local State
// ============================================================================

/// State that lives as long as the sandbox and is never shared with another
#[derive(Debug)]
pub struct SandboxState {
    id: String,
    counter: AtomicU64,
}

impl SandboxState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Increment the local counter, returning the new value
    pub fn increment(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Handle given to a handler for the duration of one task
pub struct TaskScope {
    task_id: u64,
    state: Arc<SandboxState>,
    outgoing: mpsc::UnboundedSender<SandboxEnvelope>,
}

impl TaskScope {
    pub fn new(
        task_id: u64,
        state: Arc<SandboxState>,
        outgoing: mpsc::UnboundedSender<SandboxEnvelope>,
    ) -> Self {
        Self {
            task_id,
            state,
            outgoing,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn sandbox(&self) -> &SandboxState {
        &self.state
    }

    /// A cloneable publisher for this task's events
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            task_id: self.task_id,
            outgoing: self.outgoing.clone(),
        }
    }

    pub fn publish(&self, event: WorkerEvent) {
        self.publisher().publish(event);
    }
}

/// Publishes events for one task
#[derive(Clone)]
pub struct EventPublisher {
    task_id: u64,
    outgoing: mpsc::UnboundedSender<SandboxEnvelope>,
}

impl EventPublisher {
    pub fn publish(&self, event: WorkerEvent) {
        let envelope = SandboxEnvelope {
            task_id: self.task_id,
            message: SandboxMessage::Event { event },
        };
        if self.outgoing.send(envelope).is_err() {
            debug!(task_id = self.task_id, "host is gone, dropping event");
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// A named task a sandbox can run
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, args: Vec<Value>, scope: &TaskScope) -> Result<Value, TaskError>;
}

/// Fixed set of handlers known to a sandbox
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `run` and `handshake`
    pub fn production() -> Self {
        Self::new()
            .with_handler(RunHandler)
            .with_handler(HandshakeHandler)
    }

    /// Adds `sandbox_id`, `increment`, `wait`, `throw` and `panic`
    pub fn with_diagnostics(self) -> Self {
        self.with_handler(SandboxIdHandler)
            .with_handler(IncrementHandler)
            .with_handler(WaitHandler)
            .with_handler(ThrowHandler)
            .with_handler(PanicHandler)
    }

    pub fn with_handler(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.insert(handler.name(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

pub struct HandshakeHandler;

#[async_trait]
impl TaskHandler for HandshakeHandler {
    fn name(&self) -> &'static str {
        "handshake"
    }

    async fn handle(&self, _args: Vec<Value>, _scope: &TaskScope) -> Result<Value, TaskError> {
        Ok(Value::Bool(true))
    }
}

pub struct SandboxIdHandler;

#[async_trait]
impl TaskHandler for SandboxIdHandler {
    fn name(&self) -> &'static str {
        "sandbox_id"
    }

    async fn handle(&self, _args: Vec<Value>, scope: &TaskScope) -> Result<Value, TaskError> {
        Ok(json!(scope.sandbox().id()))
    }
}

pub struct IncrementHandler;

#[async_trait]
impl TaskHandler for IncrementHandler {
    fn name(&self) -> &'static str {
        "increment"
    }

    async fn handle(&self, _args: Vec<Value>, scope: &TaskScope) -> Result<Value, TaskError> {
        Ok(json!(scope.sandbox().increment()))
    }
}

/// Sleeps for `args[0]` milliseconds (default 100) and returns the duration
pub struct WaitHandler;

#[async_trait]
impl TaskHandler for WaitHandler {
    fn name(&self) -> &'static str {
        "wait"
    }

    async fn handle(&self, args: Vec<Value>, _scope: &TaskScope) -> Result<Value, TaskError> {
        let ms = args.first().and_then(Value::as_u64).unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    }
}

pub struct ThrowHandler;

#[async_trait]
impl TaskHandler for ThrowHandler {
    fn name(&self) -> &'static str {
        "throw"
    }

    async fn handle(&self, args: Vec<Value>, _scope: &TaskScope) -> Result<Value, TaskError> {
        let message = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("test error")
            .to_string();
        Err(TaskError::fail("Error", message))
    }
}

/// Uncaught fault: takes the whole sandbox down
pub struct PanicHandler;

#[async_trait]
impl TaskHandler for PanicHandler {
    fn name(&self) -> &'static str {
        "panic"
    }

    async fn handle(&self, _args: Vec<Value>, scope: &TaskScope) -> Result<Value, TaskError> {
        panic!("sandbox {} panicked on request", scope.sandbox().id());
    }
}

/// Exits the process with `args[0]` (default 1)
pub struct ExitHandler;

#[async_trait]
impl TaskHandler for ExitHandler {
    fn name(&self) -> &'static str {
        "exit"
    }

    async fn handle(&self, args: Vec<Value>, _scope: &TaskScope) -> Result<Value, TaskError> {
        let code = args.first().and_then(Value::as_i64).unwrap_or(1);
        std::process::exit(code as i32);
    }
}

// ============================================================================
// Serve Loop
// ============================================================================

/// Execute tasks one at a time until the host closes its side
pub async fn serve(
    registry: Arc<HandlerRegistry>,
    state: Arc<SandboxState>,
    mut incoming: mpsc::UnboundedReceiver<HostMessage>,
    outgoing: mpsc::UnboundedSender<SandboxEnvelope>,
) {
    debug!(sandbox_id = %state.id(), "sandbox ready");

    while let Some(message) = incoming.recv().await {
        match message {
            HostMessage::RunTask {
                task_id,
                task,
                args,
            } => {
                let scope = TaskScope::new(task_id, Arc::clone(&state), outgoing.clone());
                let outcome = match registry.get(&task) {
                    Some(handler) => handler.handle(args, &scope).await,
                    None => {
                        warn!(task = %task, "unknown task");
                        Err(TaskError::protocol(format!("unknown task: {task}")))
                    }
                };

                let message = match outcome {
                    Ok(result) => SandboxMessage::ResolveTask { result },
                    Err(error) => SandboxMessage::RejectTask { error },
                };
                if outgoing.send(SandboxEnvelope { task_id, message }).is_err() {
                    break;
                }
            }
        }
    }

    debug!(sandbox_id = %state.id(), "sandbox stopped");
}
