//! Plan runtime
//!
//! Runs an [`ExecutionPlan`] inside a sandbox. Each job's expression is a
//! minijinja expression evaluated with strict undefined against
//! `{state, configuration, adaptor}`; the job's adaptor functions and a scoped
//! `log()` are the only functions available. A map result becomes the next
//! state.
//!
//! Job failures are data, not task errors: the failing job's id is recorded in
//! `state.error`, `data` is carried over from the job's input and the job's
//! successors are skipped.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use async_trait::async_trait;
use conveyor_core::serde_util::millis;
use minijinja::{context, Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use tracing::debug;

use crate::events::{ErrorInfo, WorkerEvent};
use crate::plan::{ExecutionPlan, Job, RunOptions};
use crate::rpc::TaskError;
use crate::sandbox::adaptor::Adaptor;
use crate::sandbox::harness::{EventPublisher, TaskHandler, TaskScope};

/// The `run` task: args are `[plan, options]`
pub struct RunHandler;

#[async_trait]
impl TaskHandler for RunHandler {
    fn name(&self) -> &'static str {
        "run"
    }

    async fn handle(&self, args: Vec<Value>, scope: &TaskScope) -> Result<Value, TaskError> {
        let mut args = args.into_iter();
        let plan: ExecutionPlan = args
            .next()
            .ok_or_else(|| TaskError::protocol("run requires a plan"))
            .and_then(|raw| {
                serde_json::from_value(raw)
                    .map_err(|e| TaskError::protocol(format!("invalid plan: {e}")))
            })?;
        let options: RunOptions = match args.next() {
            Some(Value::Null) | None => RunOptions::default(),
            Some(raw) => serde_json::from_value(raw)
                .map_err(|e| TaskError::protocol(format!("invalid run options: {e}")))?,
        };

        let runner = PlanRunner {
            plan: &plan,
            options: &options,
            thread_id: scope.sandbox().id().to_string(),
            events: scope.publisher(),
        };
        runner.run()
    }
}

struct PlanRunner<'a> {
    plan: &'a ExecutionPlan,
    options: &'a RunOptions,
    thread_id: String,
    events: EventPublisher,
}

enum JobOutcome {
    Complete(Value),
    Failed(Value),
}

impl PlanRunner<'_> {
    fn run(&self) -> Result<Value, TaskError> {
        let started = Instant::now();
        let workflow_id = self.plan.id.clone();
        self.events.publish(WorkerEvent::WorkflowStart {
            workflow_id: workflow_id.clone(),
            thread_id: self.thread_id.clone(),
        });

        let mut state = initial_state(self.plan.initial_state.clone());
        let mut pending: VecDeque<(String, Value)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();

        if let Some(first) = self.first_job()? {
            pending.push_back((first.id.clone(), state.clone()));
        }

        while let Some((job_id, input)) = pending.pop_front() {
            if !visited.insert(job_id.clone()) {
                continue;
            }
            let job = self
                .plan
                .job(&job_id)
                .ok_or_else(|| TaskError::fail("ValidationError", format!("unknown job: {job_id}")))?;

            match self.run_job(job, input) {
                JobOutcome::Complete(output) => {
                    for next in self.successors(job) {
                        pending.push_back((next, output.clone()));
                    }
                    state = output;
                }
                JobOutcome::Failed(output) => state = output,
            }
        }

        self.events.publish(WorkerEvent::WorkflowComplete {
            workflow_id,
            thread_id: self.thread_id.clone(),
            state: state.clone(),
            duration_ms: millis(started.elapsed()),
        });
        Ok(state)
    }

    fn first_job(&self) -> Result<Option<&Job>, TaskError> {
        match &self.plan.start {
            Some(start) => self
                .plan
                .job(start)
                .map(Some)
                .ok_or_else(|| TaskError::fail("ValidationError", format!("unknown start job: {start}"))),
            None => Ok(self.plan.jobs.first()),
        }
    }

    /// Explicit `next` edges in a graph plan, declaration order otherwise
    fn successors(&self, job: &Job) -> Vec<String> {
        if self.plan.is_graph() {
            return job.next.clone();
        }
        self.plan
            .jobs
            .iter()
            .position(|j| j.id == job.id)
            .and_then(|index| self.plan.jobs.get(index + 1))
            .map(|next| vec![next.id.clone()])
            .unwrap_or_default()
    }

    fn run_job(&self, job: &Job, input: Value) -> JobOutcome {
        let started = Instant::now();
        self.events.publish(WorkerEvent::JobStart {
            workflow_id: self.plan.id.clone(),
            thread_id: self.thread_id.clone(),
            job_id: job.id.clone(),
        });

        let input = with_job_data(input, job.data.as_ref());
        match self.evaluate(job, &input) {
            Ok(output) => {
                self.events.publish(WorkerEvent::JobComplete {
                    workflow_id: self.plan.id.clone(),
                    thread_id: self.thread_id.clone(),
                    job_id: job.id.clone(),
                    state: output.clone(),
                    duration_ms: millis(started.elapsed()),
                });
                JobOutcome::Complete(output)
            }
            Err(error) => {
                debug!(job_id = %job.id, error = %error.message, "job failed");
                let output = failed_state(input, &job.id, &error.message);
                self.events.publish(WorkerEvent::JobError {
                    workflow_id: self.plan.id.clone(),
                    thread_id: self.thread_id.clone(),
                    job_id: job.id.clone(),
                    error,
                    state: output.clone(),
                });
                JobOutcome::Failed(output)
            }
        }
    }

    fn evaluate(&self, job: &Job, input: &Value) -> Result<Value, ErrorInfo> {
        let Some(source) = job.expression.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(input.clone());
        };

        let adaptor = match job.adaptor.as_deref() {
            Some(specifier) => Some(
                Adaptor::resolve(specifier, &self.options.adaptor_paths)
                    .map_err(|message| ErrorInfo::new("AdaptorError", message))?,
            ),
            None => None,
        };

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        if let Some(adaptor) = &adaptor {
            adaptor.install(&mut env);
        }

        let publisher = self.events.clone();
        let workflow_id = self.plan.id.clone();
        let thread_id = self.thread_id.clone();
        let job_id = job.id.clone();
        env.add_function("log", move |message: minijinja::Value| {
            publisher.publish(WorkerEvent::Log {
                workflow_id: workflow_id.clone(),
                thread_id: thread_id.clone(),
                job_id: Some(job_id.clone()),
                level: "info".to_string(),
                message: serde_json::to_value(&message).unwrap_or(Value::Null),
            });
            message
        });

        let expression = env
            .compile_expression(source)
            .map_err(|e| ErrorInfo::new("CompileError", e.to_string()))?;
        let result = expression
            .eval(context! {
                state => minijinja::Value::from_serialize(input),
                configuration => minijinja::Value::from_serialize(
                    job.configuration.as_ref().unwrap_or(&Value::Null)
                ),
                adaptor => minijinja::Value::from_serialize(adaptor.as_ref().map(|a| &a.info)),
            })
            .map_err(|e| ErrorInfo::new("RuntimeError", e.to_string()))?;

        let output = serde_json::to_value(&result)
            .map_err(|e| ErrorInfo::new("RuntimeError", e.to_string()))?;
        if !output.is_object() {
            return Err(ErrorInfo::new(
                "TypeError",
                format!("expression must return a map, got {}", json_kind(&output)),
            ));
        }
        Ok(output)
    }
}

fn initial_state(state: Option<Value>) -> Value {
    match state {
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Job-level data overrides the incoming `data`
fn with_job_data(state: Value, data: Option<&Value>) -> Value {
    match (state, data) {
        (Value::Object(mut map), Some(data)) => {
            map.insert("data".to_string(), data.clone());
            Value::Object(map)
        }
        (state, _) => state,
    }
}

fn failed_state(input: Value, job_id: &str, message: &str) -> Value {
    let mut state = match input {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    state
        .entry("data")
        .or_insert_with(|| Value::Object(Map::new()));

    let errors = state
        .entry("error")
        .or_insert_with(|| Value::Object(Map::new()));
    if !errors.is_object() {
        *errors = Value::Object(Map::new());
    }
    if let Value::Object(errors) = errors {
        errors.insert(job_id.to_string(), Value::String(message.to_string()));
    }
    Value::Object(state)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{SandboxEnvelope, SandboxMessage};
    use crate::sandbox::harness::SandboxState;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn run(plan: ExecutionPlan, options: RunOptions) -> (Result<Value, TaskError>, Vec<WorkerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SandboxEnvelope>();
        let scope = TaskScope::new(1, Arc::new(SandboxState::new("t-1")), tx);
        let result = RunHandler
            .handle(
                vec![
                    serde_json::to_value(&plan).unwrap(),
                    serde_json::to_value(&options).unwrap(),
                ],
                &scope,
            )
            .await;
        drop(scope);

        let mut events = vec![];
        while let Some(envelope) = rx.recv().await {
            if let SandboxMessage::Event { event } = envelope.message {
                events.push(event);
            }
        }
        (result, events)
    }

    fn kinds(events: &[WorkerEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|event| match event {
                WorkerEvent::WorkflowStart { .. } => "workflow-start",
                WorkerEvent::WorkflowComplete { .. } => "workflow-complete",
                WorkerEvent::JobStart { .. } => "job-start",
                WorkerEvent::JobComplete { .. } => "job-complete",
                WorkerEvent::JobError { .. } => "job-error",
                WorkerEvent::Log { .. } => "log",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_chain_passes_state_along() {
        let plan = ExecutionPlan::new("wf")
            .with_initial_state(json!({ "data": { "n": 1 } }))
            .with_job(Job::new("a").with_expression(r#"{"data": {"n": state.data.n + 1}}"#))
            .with_job(Job::new("b").with_expression(r#"{"data": {"n": state.data.n * 10}}"#));

        let (result, events) = run(plan, RunOptions::default()).await;
        assert_eq!(result.unwrap(), json!({ "data": { "n": 20 } }));
        assert_eq!(
            kinds(&events),
            vec![
                "workflow-start",
                "job-start",
                "job-complete",
                "job-start",
                "job-complete",
                "workflow-complete"
            ]
        );
        assert!(events.iter().all(|e| e.thread_id() == "t-1" && e.workflow_id() == "wf"));
    }

    #[tokio::test]
    async fn test_expression_error_is_captured_as_data() {
        let plan = ExecutionPlan::new("wf")
            .with_initial_state(json!({ "data": { "x": 1 } }))
            .with_job(Job::new("a").with_expression("state.data.missing.deeper"))
            .with_job(Job::new("b").with_expression(r#"{"data": "should not run"}"#));

        let (result, events) = run(plan, RunOptions::default()).await;
        let state = result.unwrap();
        assert_eq!(state["data"], json!({ "x": 1 }));
        assert!(state["error"]["a"].is_string());
        assert_eq!(
            kinds(&events),
            vec!["workflow-start", "job-start", "job-error", "workflow-complete"]
        );
    }

    #[tokio::test]
    async fn test_non_map_result_is_a_job_error() {
        let plan = ExecutionPlan::new("wf").with_job(Job::new("a").with_expression("42"));
        let (result, _) = run(plan, RunOptions::default()).await;
        let state = result.unwrap();
        assert_eq!(
            state["error"]["a"],
            json!("expression must return a map, got number")
        );
        assert_eq!(state["data"], json!({}));
    }

    #[tokio::test]
    async fn test_graph_follows_next_from_start() {
        let plan = ExecutionPlan::new("wf")
            .with_start("b")
            .with_job(Job::new("a").with_expression(r#"{"data": "a"}"#))
            .with_job(Job::new("b").with_expression(r#"{"data": "b"}"#).with_next("c"))
            .with_job(Job::new("c").with_expression(r#"{"data": state.data ~ "c"}"#));

        let (result, events) = run(plan, RunOptions::default()).await;
        assert_eq!(result.unwrap(), json!({ "data": "bc" }));
        let started: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::JobStart { job_id, .. } => Some(job_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_adaptor_and_configuration_are_injected() {
        let plan = ExecutionPlan::new("wf").with_job(
            Job::new("a")
                .with_adaptor("@openfn/language-common@1.0.0")
                .with_configuration(json!({ "user": "ada" }))
                .with_expression(r#"merge(state, {"data": adaptor.name, "user": configuration.user})"#),
        );

        let (result, _) = run(plan, RunOptions::default()).await;
        assert_eq!(result.unwrap(), json!({ "data": "common", "user": "ada" }));
    }

    #[tokio::test]
    async fn test_unresolved_adaptor_is_a_job_error() {
        let plan = ExecutionPlan::new("wf").with_job(
            Job::new("a")
                .with_adaptor("@openfn/language-http@1.0.0")
                .with_expression(r#"{"data": adaptor.name}"#),
        );

        let (result, _) = run(plan.clone(), RunOptions::default()).await;
        let state = result.unwrap();
        assert_eq!(
            state["error"]["a"],
            json!("Adaptor not found: @openfn/language-http@1.0.0")
        );

        let options = RunOptions::default().with_adaptor_path("@openfn/language-http@1.0.0", "/repo/http");
        let (result, _) = run(plan, options).await;
        assert_eq!(result.unwrap(), json!({ "data": "http" }));
    }

    #[tokio::test]
    async fn test_common_functions_are_scoped_to_common() {
        let plan = ExecutionPlan::new("wf").with_job(
            Job::new("a")
                .with_adaptor("@openfn/language-http@1.0.0")
                .with_expression(r#"merge(state, {"data": 1})"#),
        );
        let options = RunOptions::default().with_adaptor_path("@openfn/language-http@1.0.0", "/repo/http");

        let (result, _) = run(plan, options).await;
        assert!(result.unwrap()["error"]["a"].is_string());
    }

    #[tokio::test]
    async fn test_log_publishes_an_event() {
        let plan = ExecutionPlan::new("wf").with_job(
            Job::new("a").with_expression(r#"{"data": log("hello")}"#),
        );

        let (result, events) = run(plan, RunOptions::default()).await;
        assert_eq!(result.unwrap(), json!({ "data": "hello" }));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Log { message, job_id: Some(job), .. } if message == &json!("hello") && job == "a"
        )));
    }

    #[tokio::test]
    async fn test_invalid_plan_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let scope = TaskScope::new(1, Arc::new(SandboxState::new("t")), tx);
        let error = RunHandler
            .handle(vec![json!("not a plan")], &scope)
            .await
            .unwrap_err();
        assert_eq!(error.error_type, "ProtocolError");
    }
}
