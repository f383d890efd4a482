//! Lifecycle events
//!
//! [`WorkerEvent`] is what a sandbox publishes while running a plan. The host
//! turns each one into an [`EngineEvent`] for listeners, adding the terminal
//! `Error` kind that only the host can produce (timeouts, crashes).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error descriptor attached to job errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// Events published by a sandbox, in causal order for one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerEvent {
    WorkflowStart {
        workflow_id: String,
        thread_id: String,
    },
    WorkflowComplete {
        workflow_id: String,
        thread_id: String,
        state: Value,
        duration_ms: u64,
    },
    JobStart {
        workflow_id: String,
        thread_id: String,
        job_id: String,
    },
    JobComplete {
        workflow_id: String,
        thread_id: String,
        job_id: String,
        state: Value,
        duration_ms: u64,
    },
    JobError {
        workflow_id: String,
        thread_id: String,
        job_id: String,
        error: ErrorInfo,
        state: Value,
    },
    Log {
        workflow_id: String,
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        level: String,
        message: Value,
    },
}

impl WorkerEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::WorkflowStart { workflow_id, .. }
            | Self::WorkflowComplete { workflow_id, .. }
            | Self::JobStart { workflow_id, .. }
            | Self::JobComplete { workflow_id, .. }
            | Self::JobError { workflow_id, .. }
            | Self::Log { workflow_id, .. } => workflow_id,
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            Self::WorkflowStart { thread_id, .. }
            | Self::WorkflowComplete { thread_id, .. }
            | Self::JobStart { thread_id, .. }
            | Self::JobComplete { thread_id, .. }
            | Self::JobError { thread_id, .. }
            | Self::Log { thread_id, .. } => thread_id,
        }
    }
}

/// Kinds of events a listener can receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineEventKind {
    WorkflowStart,
    WorkflowComplete,
    JobStart,
    JobComplete,
    JobError,
    Log,
    Error,
}

impl EngineEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStart => "workflow-start",
            Self::WorkflowComplete => "workflow-complete",
            Self::JobStart => "job-start",
            Self::JobComplete => "job-complete",
            Self::JobError => "job-error",
            Self::Log => "log",
            Self::Error => "error",
        }
    }
}

/// Events surfaced to engine listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    WorkflowStart {
        workflow_id: String,
        thread_id: String,
    },
    WorkflowComplete {
        workflow_id: String,
        thread_id: String,
        state: Value,
        duration_ms: u64,
    },
    JobStart {
        workflow_id: String,
        thread_id: String,
        job_id: String,
    },
    JobComplete {
        workflow_id: String,
        thread_id: String,
        job_id: String,
        state: Value,
        duration_ms: u64,
    },
    JobError {
        workflow_id: String,
        thread_id: String,
        job_id: String,
        error: ErrorInfo,
        state: Value,
    },
    Log {
        workflow_id: String,
        thread_id: String,
        job_id: Option<String>,
        level: String,
        message: Value,
    },
    /// The run did not resolve (timeout, crash, rejected task)
    Error {
        workflow_id: String,
        severity: String,
        error: ErrorInfo,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EngineEventKind {
        match self {
            Self::WorkflowStart { .. } => EngineEventKind::WorkflowStart,
            Self::WorkflowComplete { .. } => EngineEventKind::WorkflowComplete,
            Self::JobStart { .. } => EngineEventKind::JobStart,
            Self::JobComplete { .. } => EngineEventKind::JobComplete,
            Self::JobError { .. } => EngineEventKind::JobError,
            Self::Log { .. } => EngineEventKind::Log,
            Self::Error { .. } => EngineEventKind::Error,
        }
    }
}

impl From<WorkerEvent> for EngineEvent {
    fn from(event: WorkerEvent) -> Self {
        match event {
            WorkerEvent::WorkflowStart {
                workflow_id,
                thread_id,
            } => Self::WorkflowStart {
                workflow_id,
                thread_id,
            },
            WorkerEvent::WorkflowComplete {
                workflow_id,
                thread_id,
                state,
                duration_ms,
            } => Self::WorkflowComplete {
                workflow_id,
                thread_id,
                state,
                duration_ms,
            },
            WorkerEvent::JobStart {
                workflow_id,
                thread_id,
                job_id,
            } => Self::JobStart {
                workflow_id,
                thread_id,
                job_id,
            },
            WorkerEvent::JobComplete {
                workflow_id,
                thread_id,
                job_id,
                state,
                duration_ms,
            } => Self::JobComplete {
                workflow_id,
                thread_id,
                job_id,
                state,
                duration_ms,
            },
            WorkerEvent::JobError {
                workflow_id,
                thread_id,
                job_id,
                error,
                state,
            } => Self::JobError {
                workflow_id,
                thread_id,
                job_id,
                error,
                state,
            },
            WorkerEvent::Log {
                workflow_id,
                thread_id,
                job_id,
                level,
                message,
            } => Self::Log {
                workflow_id,
                thread_id,
                job_id,
                level,
                message,
            },
        }
    }
}
