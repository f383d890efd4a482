//! Task RPC channel
//!
//! Host and sandbox exchange tagged messages. The host sends `run_task`; the
//! sandbox answers with any number of `event` envelopes followed by exactly one
//! `resolve_task` or `reject_task` for the same `task_id`.
//!
//! A [`TaskChannel`] owns the host side of one sandbox link and enforces the
//! single-outstanding-task rule.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use conveyor_core::serde_util::millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::events::WorkerEvent;

// ============================================================================
// Wire Types
// ============================================================================

/// How bad a task rejection is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The sandbox is no longer usable
    Crash,
    /// The task failed; the sandbox is fine
    Fail,
    /// The task was terminated
    Kill,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Fail => "fail",
            Self::Kill => "kill",
        }
    }
}

/// Rejection descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub severity: Severity,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl TaskError {
    pub fn new(severity: Severity, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            error_type: error_type.into(),
        }
    }

    /// A `fail` rejection
    pub fn fail(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Fail, error_type, message)
    }

    /// Malformed request or unknown task
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::fail("ProtocolError", message)
    }
}

/// Host to sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    RunTask {
        task_id: u64,
        task: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

/// Sandbox to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxMessage {
    ResolveTask { result: Value },
    RejectTask { error: TaskError },
    Event { event: WorkerEvent },
}

impl SandboxMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Event { .. })
    }
}

/// A sandbox message addressed to one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxEnvelope {
    pub task_id: u64,
    #[serde(flatten)]
    pub message: SandboxMessage,
}

/// A named task with positional arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub args: Vec<Value>,
}

impl Task {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

// ============================================================================
// TaskChannel
// ============================================================================

/// Host side of a sandbox link
pub struct TaskChannel {
    outgoing: mpsc::UnboundedSender<HostMessage>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<SandboxEnvelope>>>,
    next_task_id: AtomicU64,
    busy: AtomicBool,
    healthy: AtomicBool,
}

/// Clears the busy flag and hands the receiver back, even if the dispatch future is dropped
struct InFlight<'a> {
    channel: &'a TaskChannel,
    incoming: Option<mpsc::UnboundedReceiver<SandboxEnvelope>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.channel.incoming.lock() = self.incoming.take();
        self.channel.busy.store(false, Ordering::SeqCst);
    }
}

impl TaskChannel {
    pub fn new(
        outgoing: mpsc::UnboundedSender<HostMessage>,
        incoming: mpsc::UnboundedReceiver<SandboxEnvelope>,
    ) -> Self {
        Self {
            outgoing,
            incoming: Mutex::new(Some(incoming)),
            next_task_id: AtomicU64::new(1),
            busy: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// False once the sandbox crashed, timed out or reported a fatal rejection
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Run one task to its terminal outcome
    ///
    /// Events for the in-flight task are passed to `on_event` as they arrive.
    /// Messages for any other task id are dropped. Exactly one outcome is
    /// returned: the first terminal message, a timeout, or a crash when the
    /// sandbox closes its side of the link.
    pub async fn dispatch(
        &self,
        task: Task,
        timeout: Duration,
        on_event: &mut (dyn FnMut(WorkerEvent) + Send),
    ) -> Result<Value, EngineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::Protocol("sandbox busy".to_string()));
        }

        let mut in_flight = InFlight {
            channel: self,
            incoming: self.incoming.lock().take(),
        };
        let Some(incoming) = in_flight.incoming.as_mut() else {
            self.mark_unhealthy();
            return Err(EngineError::Protocol("sandbox link unavailable".to_string()));
        };

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        debug!(task_id, task = %task.name, timeout_ms = millis(timeout), "dispatching task");

        let message = HostMessage::RunTask {
            task_id,
            task: task.name,
            args: task.args,
        };
        if self.outgoing.send(message).is_err() {
            self.mark_unhealthy();
            return Err(EngineError::Crash {
                message: "sandbox is not accepting tasks".to_string(),
            });
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.mark_unhealthy();
                    warn!(task_id, "task timed out");
                    return Err(EngineError::Timeout {
                        timeout_ms: millis(timeout),
                    });
                }
                envelope = incoming.recv() => {
                    let Some(envelope) = envelope else {
                        self.mark_unhealthy();
                        return Err(EngineError::Crash {
                            message: "sandbox exited unexpectedly".to_string(),
                        });
                    };

                    if envelope.task_id != task_id {
                        warn!(
                            expected = task_id,
                            received = envelope.task_id,
                            terminal = envelope.message.is_terminal(),
                            "ignoring message for another task"
                        );
                        continue;
                    }

                    match envelope.message {
                        SandboxMessage::Event { event } => {
                            trace!(task_id, "task event");
                            on_event(event);
                        }
                        SandboxMessage::ResolveTask { result } => {
                            debug!(task_id, "task resolved");
                            return Ok(result);
                        }
                        SandboxMessage::RejectTask { error } => {
                            debug!(task_id, severity = ?error.severity, "task rejected");
                            let error = EngineError::from(error);
                            if error.is_fatal() {
                                self.mark_unhealthy();
                            }
                            return Err(error);
                        }
                    }
                }
            }
        }
    }
}
