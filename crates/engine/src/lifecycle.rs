// Lifecycle Event Mapping
//
// Sandbox events are translated into engine events with the run context
// attached and dispatched to an EngineListener.
//
// Key design decisions:
// - Translation is a pure function (WorkerEvent -> EngineEvent)
// - The run's event whitelist filters every kind except `error`
// - `error` is emitted by the host only and is the last event of a failed run
// - Bookkeeping (jobs started/completed, errors, result) lives in RunState

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::EngineError;
use crate::events::{EngineEvent, EngineEventKind, ErrorInfo, WorkerEvent};
use crate::plan::{ExecutionPlan, RunOptions};

// ============================================================================
// Run Context
// ============================================================================

/// Bookkeeping for one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunState {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub thread_id: Option<String>,
    pub jobs_started: Vec<String>,
    pub jobs_completed: Vec<String>,
    /// `(job id, message)`; job id is `None` for run-level errors
    pub errors: Vec<(Option<String>, String)>,
    pub result: Option<Value>,
}

/// Context of one in-flight run
#[derive(Debug)]
pub struct RunContext {
    plan: Arc<ExecutionPlan>,
    options: RunOptions,
    state: Mutex<RunState>,
}

impl RunContext {
    pub fn new(plan: Arc<ExecutionPlan>, options: RunOptions) -> Self {
        Self {
            plan,
            options,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.plan.id
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Snapshot of the bookkeeping so far
    pub fn state(&self) -> RunState {
        self.state.lock().clone()
    }

    fn allows(&self, kind: EngineEventKind) -> bool {
        kind == EngineEventKind::Error
            || self
                .options
                .event_whitelist
                .as_ref()
                .map_or(true, |kinds| kinds.contains(&kind))
    }

    fn record(&self, event: &EngineEvent) {
        let mut state = self.state.lock();
        match event {
            EngineEvent::WorkflowStart { thread_id, .. } => {
                state.started_at = Some(Utc::now());
                state.thread_id = Some(thread_id.clone());
            }
            EngineEvent::WorkflowComplete { state: result, .. } => {
                state.completed_at = Some(Utc::now());
                state.result = Some(result.clone());
            }
            EngineEvent::JobStart { job_id, .. } => state.jobs_started.push(job_id.clone()),
            EngineEvent::JobComplete { job_id, .. } => state.jobs_completed.push(job_id.clone()),
            EngineEvent::JobError { job_id, error, .. } => {
                state.errors.push((Some(job_id.clone()), error.message.clone()))
            }
            EngineEvent::Log { .. } => {}
            EngineEvent::Error { error, .. } => {
                state.completed_at = Some(Utc::now());
                state.errors.push((None, error.message.clone()));
            }
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Receives engine events for a run
///
/// Callbacks run on the submitting task while the run is in flight; keep them
/// fast and hand heavy work off to a channel.
#[allow(unused_variables)]
pub trait EngineListener: Send + Sync {
    fn workflow_start(&self, ctx: &RunContext, thread_id: &str) {}

    fn workflow_complete(&self, ctx: &RunContext, state: &Value, duration_ms: u64) {}

    fn job_start(&self, ctx: &RunContext, job_id: &str) {}

    fn job_complete(&self, ctx: &RunContext, job_id: &str, state: &Value, duration_ms: u64) {}

    fn job_error(&self, ctx: &RunContext, job_id: &str, error: &ErrorInfo, state: &Value) {}

    fn log(&self, ctx: &RunContext, job_id: Option<&str>, level: &str, message: &Value) {}

    /// The run did not resolve
    fn error(&self, ctx: &RunContext, severity: &str, error: &ErrorInfo) {}
}

/// Listener that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl EngineListener for NoopListener {}

// ============================================================================
// Mapper
// ============================================================================

/// Translate a sandbox event
pub fn translate(event: WorkerEvent) -> EngineEvent {
    EngineEvent::from(event)
}

/// Routes one run's events to its listener
pub struct Lifecycle<'a> {
    ctx: &'a RunContext,
    listener: &'a dyn EngineListener,
}

impl<'a> Lifecycle<'a> {
    pub fn new(ctx: &'a RunContext, listener: &'a dyn EngineListener) -> Self {
        Self { ctx, listener }
    }

    /// Handle an event published by the sandbox
    pub fn handle(&self, event: WorkerEvent) {
        self.emit(translate(event));
    }

    /// Emit the terminal `error` event for a run that did not resolve
    pub fn fail(&self, error: &EngineError) {
        self.emit(EngineEvent::Error {
            workflow_id: self.ctx.workflow_id().to_string(),
            severity: error.severity().as_str().to_string(),
            error: ErrorInfo::new(error.error_type(), error.to_string()),
        });
    }

    fn emit(&self, event: EngineEvent) {
        self.ctx.record(&event);

        let kind = event.kind();
        if !self.ctx.allows(kind) {
            trace!(kind = kind.as_str(), "event filtered");
            return;
        }

        let ctx = self.ctx;
        match &event {
            EngineEvent::WorkflowStart { thread_id, .. } => {
                self.listener.workflow_start(ctx, thread_id)
            }
            EngineEvent::WorkflowComplete {
                state, duration_ms, ..
            } => self.listener.workflow_complete(ctx, state, *duration_ms),
            EngineEvent::JobStart { job_id, .. } => self.listener.job_start(ctx, job_id),
            EngineEvent::JobComplete {
                job_id,
                state,
                duration_ms,
                ..
            } => self.listener.job_complete(ctx, job_id, state, *duration_ms),
            EngineEvent::JobError {
                job_id,
                error,
                state,
                ..
            } => self.listener.job_error(ctx, job_id, error, state),
            EngineEvent::Log {
                job_id,
                level,
                message,
                ..
            } => self.listener.log(ctx, job_id.as_deref(), level, message),
            EngineEvent::Error {
                severity, error, ..
            } => self.listener.error(ctx, severity, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EngineListener for Recorder {
        fn workflow_start(&self, ctx: &RunContext, thread_id: &str) {
            self.seen
                .lock()
                .push(format!("workflow-start {} {}", ctx.workflow_id(), thread_id));
        }

        fn job_start(&self, _ctx: &RunContext, job_id: &str) {
            self.seen.lock().push(format!("job-start {job_id}"));
        }

        fn log(&self, _ctx: &RunContext, _job_id: Option<&str>, _level: &str, message: &Value) {
            self.seen.lock().push(format!("log {message}"));
        }

        fn error(&self, _ctx: &RunContext, severity: &str, error: &ErrorInfo) {
            self.seen
                .lock()
                .push(format!("error {} {}", severity, error.error_type));
        }
    }

    fn context(whitelist: Option<Vec<EngineEventKind>>) -> RunContext {
        let options = RunOptions {
            event_whitelist: whitelist,
            ..Default::default()
        };
        RunContext::new(Arc::new(ExecutionPlan::new("wf-1")), options)
    }

    fn job_start(job_id: &str) -> WorkerEvent {
        WorkerEvent::JobStart {
            workflow_id: "wf-1".into(),
            thread_id: "t".into(),
            job_id: job_id.into(),
        }
    }

    #[test]
    fn test_events_reach_the_listener_with_context() {
        let ctx = context(None);
        let recorder = Recorder::default();
        let lifecycle = Lifecycle::new(&ctx, &recorder);

        lifecycle.handle(WorkerEvent::WorkflowStart {
            workflow_id: "wf-1".into(),
            thread_id: "thread-3".into(),
        });
        lifecycle.handle(job_start("a"));

        assert_eq!(
            *recorder.seen.lock(),
            vec!["workflow-start wf-1 thread-3", "job-start a"]
        );
        let state = ctx.state();
        assert_eq!(state.thread_id.as_deref(), Some("thread-3"));
        assert_eq!(state.jobs_started, vec!["a"]);
    }

    #[test]
    fn test_whitelist_filters_but_never_drops_error() {
        let ctx = context(Some(vec![EngineEventKind::Log]));
        let recorder = Recorder::default();
        let lifecycle = Lifecycle::new(&ctx, &recorder);

        lifecycle.handle(job_start("a"));
        lifecycle.handle(WorkerEvent::Log {
            workflow_id: "wf-1".into(),
            thread_id: "t".into(),
            job_id: None,
            level: "info".into(),
            message: json!("hi"),
        });
        lifecycle.fail(&EngineError::Timeout { timeout_ms: 10 });

        assert_eq!(
            *recorder.seen.lock(),
            vec!["log \"hi\"", "error kill TimeoutError"]
        );
        // Filtered events are still recorded
        assert_eq!(ctx.state().jobs_started, vec!["a"]);
        assert_eq!(ctx.state().errors.len(), 1);
    }
}
