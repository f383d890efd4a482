//! Engine errors

use conveyor_core::CompletionReason;

use crate::rpc::{Severity, TaskError};

/// Engine errors
///
/// Job failures inside a plan are not errors: they are recorded in the final
/// state. These variants describe tasks that did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The sandbox protocol was violated (busy sandbox, unknown task, bad payload)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The task did not finish before its deadline
    #[error("task timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The sandbox died or reported a fatal fault
    #[error("sandbox crashed: {message}")]
    Crash { message: String },

    /// The sandbox terminated the task itself
    #[error("task killed: {message}")]
    Killed { message: String },

    /// The task was rejected with `fail` severity
    #[error("{error_type}: {message}")]
    Execution { error_type: String, message: String },

    /// A sandbox could not be started
    #[error("failed to spawn sandbox: {0}")]
    Spawn(String),

    /// The pool is shut down
    #[error("worker pool is shut down")]
    Shutdown,
}

impl EngineError {
    /// Completion reason an attempt should report for this error
    pub fn reason(&self) -> CompletionReason {
        match self {
            Self::Timeout { .. } | Self::Killed { .. } => CompletionReason::Kill,
            Self::Crash { .. } => CompletionReason::Crash,
            Self::Shutdown => CompletionReason::Cancel,
            Self::Protocol(_) | Self::Execution { .. } | Self::Spawn(_) => CompletionReason::Fail,
        }
    }

    /// Severity of the error as the sandbox would report it
    pub fn severity(&self) -> Severity {
        match self.reason() {
            CompletionReason::Crash => Severity::Crash,
            CompletionReason::Kill => Severity::Kill,
            _ => Severity::Fail,
        }
    }

    /// Short error type name, reported as `error_type` on completion
    pub fn error_type(&self) -> &str {
        match self {
            Self::Protocol(_) => "ProtocolError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Crash { .. } => "CrashError",
            Self::Killed { .. } => "KillError",
            Self::Execution { error_type, .. } => error_type,
            Self::Spawn(_) => "SpawnError",
            Self::Shutdown => "ShutdownError",
        }
    }

    /// Whether the sandbox that produced this error may be reused
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Crash { .. } | Self::Killed { .. }
        )
    }
}

impl From<TaskError> for EngineError {
    fn from(error: TaskError) -> Self {
        match error.severity {
            Severity::Crash => Self::Crash {
                message: error.message,
            },
            Severity::Kill => Self::Killed {
                message: error.message,
            },
            Severity::Fail => Self::Execution {
                error_type: error.error_type,
                message: error.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            EngineError::Timeout { timeout_ms: 10 }.reason(),
            CompletionReason::Kill
        );
        assert_eq!(
            EngineError::Crash {
                message: "gone".into()
            }
            .reason(),
            CompletionReason::Crash
        );
        assert_eq!(
            EngineError::Execution {
                error_type: "Error".into(),
                message: "x".into()
            }
            .reason(),
            CompletionReason::Fail
        );
        assert_eq!(EngineError::Shutdown.reason(), CompletionReason::Cancel);
    }

    #[test]
    fn test_from_task_error() {
        let error: EngineError = TaskError::new(Severity::Crash, "CrashError", "oom").into();
        assert!(error.is_fatal());
        assert_eq!(error.error_type(), "CrashError");

        let error: EngineError = TaskError::new(Severity::Fail, "TypeError", "nope").into();
        assert!(!error.is_fatal());
        assert_eq!(error.error_type(), "TypeError");
        assert_eq!(error.to_string(), "TypeError: nope");
    }
}
