// Attempt runner
// Decision: An attempt is prepared entirely from the channel (definition, credentials,
//           dataclip) before anything is dispatched to a sandbox
// Decision: Job failures are reported as `fail`; crashes and timeouts keep their own reasons
//
// Flow for one attempt:
// - join `attempt:<id>`, fetch the definition
// - fetch every referenced credential and the initial dataclip
// - build an ExecutionPlan (edges become `next` links) and run it through the engine
// - stream `attempt_log` / `run_complete` while the run is in flight
// - push `attempt_complete` once, after every streamed event has been acknowledged

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use conveyor_core::{
    events, AttemptCompletePayload, AttemptDefinition, AttemptLogPayload, CompletionReason,
    ResourceRequest, RunCompletePayload, Topic,
};
use conveyor_engine::{
    Engine, EngineError, EngineListener, ErrorInfo, ExecutionPlan, Job, RunContext, RunOptions,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::transport::QueueTransport;

/// Error type reported when the attempt could not be prepared
const PREPARE_ERROR: &str = "AttemptError";
/// Error type reported when the engine signalled a job error
const JOB_ERROR: &str = "JobError";
/// Error type reported when the worker lost track of an attempt
const WORKER_ERROR: &str = "WorkerError";

// =============================================================================
// Plan building
// =============================================================================

/// Translate an attempt definition into an execution plan
///
/// Credentials become the job configuration. Edges between jobs become `next`
/// links; a trigger edge picks the starting job unless one is set explicitly.
pub fn build_plan(
    definition: &AttemptDefinition,
    credentials: &HashMap<String, Value>,
    initial_state: Option<Value>,
) -> ExecutionPlan {
    let mut plan = ExecutionPlan::new(definition.id.clone());

    for job in &definition.jobs {
        let mut step = Job::new(job.id.clone()).with_expression(job.body.clone());
        if let Some(adaptor) = &job.adaptor {
            step = step.with_adaptor(adaptor.clone());
        }
        if let Some(credential) = job.credential_id.as_ref().and_then(|id| credentials.get(id)) {
            step = step.with_configuration(credential.clone());
        }
        for edge in &definition.edges {
            if edge.source_job_id.as_deref() == Some(job.id.as_str()) {
                step = step.with_next(edge.target_job_id.clone());
            }
        }
        plan = plan.with_job(step);
    }

    let start = definition.starting_job_id.clone().or_else(|| {
        definition
            .edges
            .iter()
            .find(|edge| edge.source_trigger_id.is_some())
            .map(|edge| edge.target_job_id.clone())
    });
    if let Some(start) = start {
        plan = plan.with_start(start);
    }
    if let Some(state) = initial_state {
        plan = plan.with_initial_state(state);
    }
    plan
}

/// First job error reported by the engine during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: String,
    pub message: String,
}

/// Completion payload for the outcome of a run
///
/// A resolved run is a failure only if the engine reported a job error; the
/// shape of the final state is never inspected.
pub fn completion_for(
    result: &Result<Value, EngineError>,
    job_failure: Option<&JobFailure>,
) -> AttemptCompletePayload {
    match (result, job_failure) {
        (Ok(_), Some(failure)) => AttemptCompletePayload::failure(
            CompletionReason::Fail,
            JOB_ERROR,
            format!("{}: {}", failure.job_id, failure.message),
        ),
        (Ok(_), None) => AttemptCompletePayload::success(),
        (Err(e), _) => AttemptCompletePayload::failure(e.reason(), e.error_type(), e.to_string()),
    }
}

// =============================================================================
// Event forwarding
// =============================================================================

enum Outbound {
    Log(AttemptLogPayload),
    RunComplete(RunCompletePayload),
}

/// Turns engine callbacks into channel pushes (in order, off the callback path)
struct AttemptListener {
    tx: mpsc::UnboundedSender<Outbound>,
    failure: Mutex<Option<JobFailure>>,
}

impl AttemptListener {
    fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            failure: Mutex::new(None),
        }
    }

    fn into_failure(self) -> Option<JobFailure> {
        self.failure.into_inner()
    }

    fn send_log(&self, job_id: Option<&str>, level: &str, message: Value) {
        let _ = self.tx.send(Outbound::Log(AttemptLogPayload {
            job_id: job_id.map(str::to_string),
            level: level.to_string(),
            message,
            timestamp: Utc::now().timestamp_millis(),
        }));
    }
}

impl EngineListener for AttemptListener {
    fn job_complete(&self, _ctx: &RunContext, job_id: &str, state: &Value, duration_ms: u64) {
        self.send_log(
            Some(job_id),
            "info",
            json!(format!("job {job_id} completed in {duration_ms}ms")),
        );
        let _ = self.tx.send(Outbound::RunComplete(RunCompletePayload {
            job_id: job_id.to_string(),
            output_dataclip: state.clone(),
        }));
    }

    fn job_error(&self, _ctx: &RunContext, job_id: &str, error: &ErrorInfo, state: &Value) {
        self.failure.lock().get_or_insert_with(|| JobFailure {
            job_id: job_id.to_string(),
            message: error.message.clone(),
        });
        self.send_log(
            Some(job_id),
            "error",
            json!(format!("{}: {}", error.error_type, error.message)),
        );
        let _ = self.tx.send(Outbound::RunComplete(RunCompletePayload {
            job_id: job_id.to_string(),
            output_dataclip: state.clone(),
        }));
    }

    fn log(&self, _ctx: &RunContext, job_id: Option<&str>, level: &str, message: &Value) {
        self.send_log(job_id, level, message.clone());
    }

    fn error(&self, _ctx: &RunContext, severity: &str, error: &ErrorInfo) {
        self.send_log(
            None,
            "error",
            json!(format!("[{severity}] {}: {}", error.error_type, error.message)),
        );
    }
}

async fn forward(
    transport: Arc<dyn QueueTransport>,
    topic: String,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let (event, payload) = match outbound {
            Outbound::Log(log) => (events::ATTEMPT_LOG, serde_json::to_value(log)),
            Outbound::RunComplete(run) => (events::RUN_COMPLETE, serde_json::to_value(run)),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, "failed to encode {}: {}", event, e);
                continue;
            }
        };
        if let Err(e) = transport.push(&topic, event, payload).await {
            warn!(topic = %topic, "{} not delivered: {}", event, e);
        }
    }
}

// =============================================================================
// AttemptRunner
// =============================================================================

pub struct AttemptRunner {
    transport: Arc<dyn QueueTransport>,
    engine: Arc<Engine>,
    repo_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl AttemptRunner {
    pub fn new(transport: Arc<dyn QueueTransport>, engine: Arc<Engine>) -> Self {
        Self {
            transport,
            engine,
            repo_dir: None,
            timeout: None,
        }
    }

    pub fn with_repo_dir(mut self, repo_dir: Option<PathBuf>) -> Self {
        self.repo_dir = repo_dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one claimed attempt to completion and report the outcome
    ///
    /// Fails only when the outcome could not be reported.
    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    pub async fn run(&self, attempt_id: &str) -> Result<AttemptCompletePayload> {
        let topic = Topic::attempt(attempt_id).to_string();
        self.transport
            .join(&topic)
            .await
            .with_context(|| format!("Failed to join {topic}"))?;

        let payload = match self.prepare(&topic).await {
            Ok((plan, options)) => {
                info!(jobs = plan.jobs.len(), "executing attempt");
                let (result, job_failure) = self.execute(&topic, plan, options).await;
                completion_for(&result, job_failure.as_ref())
            }
            Err(e) => {
                warn!("failed to prepare attempt: {:#}", e);
                AttemptCompletePayload::failure(
                    CompletionReason::Fail,
                    PREPARE_ERROR,
                    format!("{e:#}"),
                )
            }
        };

        let raw = serde_json::to_value(&payload).context("Failed to encode completion")?;
        self.transport
            .push(&topic, events::ATTEMPT_COMPLETE, raw)
            .await
            .context("Failed to report completion")?;
        info!(reason = %payload.reason, "attempt complete");

        if let Err(e) = self.transport.leave(&topic).await {
            debug!("leave failed: {}", e);
        }
        Ok(payload)
    }

    /// Best-effort `crash` completion for an attempt whose run failed before reporting
    ///
    /// Fails when the queue cannot be reached; the server keeps the attempt
    /// `running` in that case.
    pub async fn report_crash(&self, attempt_id: &str, error: &anyhow::Error) -> Result<()> {
        let topic = Topic::attempt(attempt_id).to_string();
        self.transport
            .join(&topic)
            .await
            .with_context(|| format!("Failed to join {topic}"))?;

        let payload = AttemptCompletePayload::failure(
            CompletionReason::Crash,
            WORKER_ERROR,
            format!("{error:#}"),
        );
        let raw = serde_json::to_value(&payload).context("Failed to encode completion")?;
        let pushed = self
            .transport
            .push(&topic, events::ATTEMPT_COMPLETE, raw)
            .await
            .context("Failed to report crash");

        if let Err(e) = self.transport.leave(&topic).await {
            debug!("leave failed: {}", e);
        }
        pushed.map(|_| ())
    }

    async fn prepare(&self, topic: &str) -> Result<(ExecutionPlan, RunOptions)> {
        let raw = self
            .transport
            .push(topic, events::GET_ATTEMPT, json!({}))
            .await
            .context("Failed to fetch attempt")?;
        let definition: AttemptDefinition =
            serde_json::from_value(raw).context("Invalid attempt definition")?;

        let mut credentials = HashMap::new();
        for id in definition.credential_ids() {
            let body = self
                .fetch(topic, events::GET_CREDENTIAL, &id)
                .await
                .with_context(|| format!("Failed to fetch credential {id}"))?;
            credentials.insert(id, body);
        }

        let initial_state = match &definition.dataclip_id {
            Some(id) => Some(
                self.fetch(topic, events::GET_DATACLIP, id)
                    .await
                    .with_context(|| format!("Failed to fetch dataclip {id}"))?,
            ),
            None => None,
        };

        let mut options = RunOptions::default();
        if let Some(repo_dir) = &self.repo_dir {
            for specifier in definition.adaptors() {
                let path = repo_dir.join(&specifier);
                options = options.with_adaptor_path(specifier, path.to_string_lossy());
            }
        }
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(timeout);
        }

        Ok((build_plan(&definition, &credentials, initial_state), options))
    }

    async fn fetch(&self, topic: &str, event: &str, id: &str) -> Result<Value> {
        let request = serde_json::to_value(ResourceRequest { id: id.to_string() })?;
        Ok(self.transport.push(topic, event, request).await?)
    }

    async fn execute(
        &self,
        topic: &str,
        plan: ExecutionPlan,
        options: RunOptions,
    ) -> (Result<Value, EngineError>, Option<JobFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(
            Arc::clone(&self.transport),
            topic.to_string(),
            rx,
        ));

        let listener = AttemptListener::new(tx);
        let result = self.engine.execute(plan, options, &listener).await;

        // Logs and job outputs must land before the completion
        let job_failure = listener.into_failure();
        if let Err(e) = forwarder.await {
            warn!("event forwarder failed: {}", e);
        }
        (result, job_failure)
    }
}
