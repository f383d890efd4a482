//! Execution plans and run options
//!
//! Plans arrive already compiled. They are immutable once dispatched: the
//! engine keeps an `Arc<ExecutionPlan>` for the run context and serializes a
//! copy into the sandbox.

use std::collections::HashMap;
use std::time::Duration;

use conveyor_core::serde_util::option_duration_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EngineEventKind;

/// A compiled workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,

    #[serde(default)]
    pub jobs: Vec<Job>,

    /// Job to start from when the plan is a graph (defaults to the first job)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// Initial state handed to the first job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Value>,
}

impl ExecutionPlan {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            jobs: vec![],
            start: None,
            initial_state: None,
        }
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_start(mut self, job_id: impl Into<String>) -> Self {
        self.start = Some(job_id.into());
        self
    }

    pub fn with_initial_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    /// Whether any job declares explicit successors
    pub fn is_graph(&self) -> bool {
        self.jobs.iter().any(|job| !job.next.is_empty())
    }

    /// Distinct adaptor specifiers used by the plan
    pub fn adaptors(&self) -> Vec<&str> {
        let mut adaptors: Vec<&str> = vec![];
        for adaptor in self.jobs.iter().filter_map(|job| job.adaptor.as_deref()) {
            if !adaptors.contains(&adaptor) {
                adaptors.push(adaptor);
            }
        }
        adaptors
    }
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptor: Option<String>,

    /// Credential body, exposed to the expression as `configuration`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Data merged into the state before the expression runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            adaptor: None,
            configuration: None,
            expression: None,
            data: None,
            next: vec![],
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_adaptor(mut self, adaptor: impl Into<String>) -> Self {
        self.adaptor = Some(adaptor.into());
        self
    }

    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_next(mut self, job_id: impl Into<String>) -> Self {
        self.next.push(job_id.into());
        self
    }
}

/// Per-run options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Overrides the pool's default run timeout
    #[serde(
        default,
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Adaptor specifier to resolved install location
    #[serde(default)]
    pub adaptor_paths: HashMap<String, String>,

    /// Event kinds surfaced to the listener (all when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_whitelist: Option<Vec<EngineEventKind>>,
}

impl RunOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_adaptor_path(mut self, specifier: impl Into<String>, path: impl Into<String>) -> Self {
        self.adaptor_paths.insert(specifier.into(), path.into());
        self
    }

    pub fn with_event_whitelist(mut self, kinds: Vec<EngineEventKind>) -> Self {
        self.event_whitelist = Some(kinds);
        self
    }
}
