//! Attempt definitions as registered with the queue server
//!
//! An attempt is one queued run of a workflow. Its definition is stored by the
//! server and handed back verbatim through `get_attempt`.

use serde::{Deserialize, Serialize};

/// Lifecycle of an attempt on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Waiting in the queue
    Pending,
    /// Removed from the queue by a worker
    Claimed,
    /// Started; the per-attempt channel may be opened
    Running,
    /// Completion was reported and accepted
    Complete,
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Claimed => write!(f, "claimed"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Full definition of an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptDefinition {
    pub id: String,

    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,

    #[serde(default)]
    pub jobs: Vec<JobDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    /// Dataclip used as the initial state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataclip_id: Option<String>,

    /// Job to start from (defaults to the first job)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_job_id: Option<String>,
}

impl AttemptDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            triggers: vec![],
            jobs: vec![],
            edges: vec![],
            dataclip_id: None,
            starting_job_id: None,
        }
    }

    pub fn with_job(mut self, job: JobDefinition) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_edge(mut self, edge: EdgeDefinition) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_dataclip(mut self, dataclip_id: impl Into<String>) -> Self {
        self.dataclip_id = Some(dataclip_id.into());
        self
    }

    /// Distinct credential ids referenced by the jobs, in job order
    pub fn credential_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = vec![];
        for job in &self.jobs {
            if let Some(id) = &job.credential_id {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }

    /// Distinct adaptor specifiers referenced by the jobs, in job order
    pub fn adaptors(&self) -> Vec<String> {
        let mut adaptors: Vec<String> = vec![];
        for job in &self.jobs {
            if let Some(adaptor) = &job.adaptor {
                if !adaptors.contains(adaptor) {
                    adaptors.push(adaptor.clone());
                }
            }
        }
        adaptors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A job as authored: adaptor, credential reference and expression body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Adaptor specifier, e.g. `@openfn/language-common@1.11.1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptor: Option<String>,

    /// Expression source
    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            adaptor: None,
            body: body.into(),
            credential_id: None,
        }
    }

    pub fn with_adaptor(mut self, adaptor: impl Into<String>) -> Self {
        self.adaptor = Some(adaptor.into());
        self
    }

    pub fn with_credential(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }
}

/// Directed edge between two jobs (or from a trigger to a job)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trigger_id: Option<String>,

    pub target_job_id: String,
}

impl EdgeDefinition {
    pub fn between(
        id: impl Into<String>,
        source_job_id: impl Into<String>,
        target_job_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_job_id: Some(source_job_id.into()),
            source_trigger_id: None,
            target_job_id: target_job_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_round_trips_without_nulls() {
        let raw = json!({
            "id": "attempt-1",
            "triggers": [],
            "jobs": [{ "id": "job-1", "adaptor": "@openfn/language-common@1.0.0", "body": "{\"data\": 1}" }],
            "edges": [],
        });

        let definition: AttemptDefinition = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(definition.jobs.len(), 1);
        assert_eq!(serde_json::to_value(&definition).unwrap(), raw);
    }

    #[test]
    fn test_credentials_and_adaptors_are_distinct() {
        let definition = AttemptDefinition::new("a")
            .with_job(JobDefinition::new("j1", "state").with_credential("c1").with_adaptor("common"))
            .with_job(JobDefinition::new("j2", "state").with_credential("c1").with_adaptor("http"))
            .with_job(JobDefinition::new("j3", "state").with_adaptor("common"));

        assert_eq!(definition.credential_ids(), vec!["c1"]);
        assert_eq!(definition.adaptors(), vec!["common", "http"]);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(AttemptStatus::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_value(AttemptStatus::Complete).unwrap(),
            json!("complete")
        );
    }
}
