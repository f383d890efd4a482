//! Engine behaviour end to end (thread sandboxes)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_engine::sandbox::{HandlerRegistry, TaskHandler, TaskScope, ThreadSpawner};
use conveyor_engine::{
    Engine, EngineError, EngineEventKind, EngineListener, ErrorInfo, ExecutionPlan, Job,
    PoolConfig, RunContext, RunOptions, SandboxMode, TaskError,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

fn engine(size: usize) -> Engine {
    Engine::new(
        PoolConfig::default()
            .with_mode(SandboxMode::Thread)
            .with_size(size)
            .with_diagnostics(true),
    )
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl EngineListener for Recorder {
    fn workflow_start(&self, ctx: &RunContext, _thread_id: &str) {
        self.events.lock().push(format!("workflow-start:{}", ctx.workflow_id()));
    }

    fn workflow_complete(&self, _ctx: &RunContext, _state: &Value, _duration_ms: u64) {
        self.events.lock().push("workflow-complete".to_string());
    }

    fn job_start(&self, _ctx: &RunContext, job_id: &str) {
        self.events.lock().push(format!("job-start:{job_id}"));
    }

    fn job_complete(&self, _ctx: &RunContext, job_id: &str, _state: &Value, _duration_ms: u64) {
        self.events.lock().push(format!("job-complete:{job_id}"));
    }

    fn job_error(&self, _ctx: &RunContext, job_id: &str, _error: &ErrorInfo, _state: &Value) {
        self.events.lock().push(format!("job-error:{job_id}"));
    }

    fn error(&self, _ctx: &RunContext, severity: &str, error: &ErrorInfo) {
        self.events
            .lock()
            .push(format!("error:{}:{}", severity, error.error_type));
    }
}

fn adaptor_plan(id: &str, adaptor: &str) -> ExecutionPlan {
    ExecutionPlan::new(id).with_job(
        Job::new(format!("{id}-job"))
            .with_adaptor(adaptor)
            .with_expression(r#"{"data": adaptor.name}"#),
    )
}

#[tokio::test]
async fn test_concurrent_runs_resolve_independently() {
    let engine = Arc::new(engine(3));
    let options = RunOptions::default()
        .with_adaptor_path("@openfn/language-http@1.0.0", "/repo/http")
        .with_adaptor_path("@openfn/language-googlesheets@2.0.0", "/repo/googlesheets");

    let runs = [
        adaptor_plan("a", "@openfn/language-common@1.0.0"),
        adaptor_plan("b", "@openfn/language-http@1.0.0"),
        adaptor_plan("c", "@openfn/language-googlesheets@2.0.0"),
    ];

    let handles: Vec<_> = runs
        .into_iter()
        .map(|plan| {
            let engine = Arc::clone(&engine);
            let options = options.clone();
            tokio::spawn(async move { engine.execute(plan, options, &Recorder::default()).await })
        })
        .collect();

    let mut results = vec![];
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(
        results,
        vec![
            json!({ "data": "common" }),
            json!({ "data": "http" }),
            json!({ "data": "googlesheets" }),
        ]
    );
}

#[tokio::test]
async fn test_expression_error_preserves_data() {
    let engine = engine(1);
    let recorder = Recorder::default();
    let plan = ExecutionPlan::new("wf")
        .with_initial_state(json!({ "data": { "patients": 3 } }))
        .with_job(Job::new("bad").with_expression("state.nope.nope"))
        .with_job(Job::new("after").with_expression(r#"{"data": 0}"#));

    let state = engine
        .execute(plan, RunOptions::default(), &recorder)
        .await
        .unwrap();

    assert_eq!(state["data"], json!({ "patients": 3 }));
    assert!(state["error"]["bad"].as_str().is_some());
    assert_eq!(
        *recorder.events.lock(),
        vec![
            "workflow-start:wf",
            "job-start:bad",
            "job-error:bad",
            "workflow-complete"
        ]
    );
}

/// A `run` handler that answers long after any reasonable deadline
struct SlowRun;

#[async_trait]
impl TaskHandler for SlowRun {
    fn name(&self) -> &'static str {
        "run"
    }

    async fn handle(&self, _args: Vec<Value>, _scope: &TaskScope) -> Result<Value, TaskError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!({ "data": "late" }))
    }
}

#[tokio::test]
async fn test_timeout_reports_exactly_one_error() {
    let spawner = ThreadSpawner::new(HandlerRegistry::new().with_handler(SlowRun));
    let engine = Engine::with_spawner(PoolConfig::default().with_size(1), Arc::new(spawner));
    let recorder = Recorder::default();
    let plan = ExecutionPlan::new("slow").with_job(Job::new("a").with_expression("state"));

    let options = RunOptions::default().with_timeout(Duration::from_millis(50));
    let result = engine.execute(plan, options, &recorder).await;

    assert_eq!(result, Err(EngineError::Timeout { timeout_ms: 50 }));
    let events = recorder.events.lock().clone();
    assert_eq!(events, vec!["error:kill:TimeoutError"]);

    // The late resolve must not surface anywhere
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(*recorder.events.lock(), events);
    assert_eq!(engine.status().live, 0);
}

#[tokio::test]
async fn test_whitelist_limits_events() {
    let engine = engine(1);
    let recorder = Recorder::default();
    let plan = ExecutionPlan::new("wf").with_job(Job::new("a").with_expression("state"));
    let options = RunOptions::default().with_event_whitelist(vec![EngineEventKind::JobComplete]);

    engine.execute(plan, options, &recorder).await.unwrap();
    assert_eq!(*recorder.events.lock(), vec!["job-complete:a"]);
}

#[tokio::test]
async fn test_shutdown_rejects_new_runs() {
    let engine = engine(1);
    engine.shutdown();
    let recorder = Recorder::default();
    let plan = ExecutionPlan::new("wf").with_job(Job::new("a").with_expression("state"));

    let result = engine.execute(plan, RunOptions::default(), &recorder).await;
    assert_eq!(result, Err(EngineError::Shutdown));
    assert_eq!(*recorder.events.lock(), vec!["error:fail:ShutdownError"]);
}
