//! Attempt state machine
//!
//! `unregistered -> pending -> claimed -> running -> complete`
//!
//! [`QueueState`] holds the queue, the attempts and their resources. It has no
//! locking of its own; the server wraps it in a single mutex.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use conveyor_core::{
    AttemptCompletePayload, AttemptDefinition, AttemptLogPayload, AttemptStatus,
    RunCompletePayload,
};
use serde::Serialize;
use serde_json::Value;

use crate::error::{QueueError, ResourceKind};

/// Everything the server knows about one attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub id: String,
    pub status: AttemptStatus,
    /// `None` for attempts started without being registered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<AttemptDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<AttemptCompletePayload>,
    /// Latest output dataclip reported through `run_complete`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub logs: Vec<AttemptLogPayload>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    fn new(id: String, status: AttemptStatus, definition: Option<AttemptDefinition>) -> Self {
        Self {
            id,
            status,
            definition,
            claimed_by: None,
            completion: None,
            result: None,
            logs: vec![],
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueState {
    queue: VecDeque<String>,
    attempts: HashMap<String, AttemptRecord>,
    credentials: HashMap<String, Value>,
    dataclips: HashMap<String, Value>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a definition without queueing it
    pub fn register(&mut self, definition: AttemptDefinition) -> Result<(), QueueError> {
        let id = definition.id.clone();
        match self.attempts.get_mut(&id) {
            Some(record) if record.status == AttemptStatus::Pending => {
                record.definition = Some(definition);
                Ok(())
            }
            Some(record) => Err(QueueError::invalid_attempt(
                id,
                format!("cannot re-register a {} attempt", record.status),
            )),
            None => {
                self.attempts.insert(
                    id.clone(),
                    AttemptRecord::new(id, AttemptStatus::Pending, Some(definition)),
                );
                Ok(())
            }
        }
    }

    /// Register and append to the queue
    pub fn enqueue(&mut self, definition: AttemptDefinition) -> Result<(), QueueError> {
        let id = definition.id.clone();
        if self.queue.contains(&id) {
            return Err(QueueError::invalid_attempt(id, "already queued"));
        }
        self.register(definition)?;
        self.queue.push_back(id);
        Ok(())
    }

    /// Pop up to `count` ids off the head of the queue
    pub fn claim(&mut self, count: usize, claimant: Option<&str>) -> Vec<String> {
        let mut claimed = Vec::with_capacity(count.min(self.queue.len()));
        while claimed.len() < count {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            if let Some(record) = self.attempts.get_mut(&id) {
                record.status = AttemptStatus::Claimed;
                record.claimed_by = claimant.map(str::to_string);
                claimed.push(id);
            }
        }
        claimed
    }

    /// Mark an attempt running so its channel can be joined
    ///
    /// Unknown ids are created on the fly (with no definition).
    pub fn start(&mut self, id: &str) -> Result<(), QueueError> {
        let record = self
            .attempts
            .entry(id.to_string())
            .or_insert_with(|| AttemptRecord::new(id.to_string(), AttemptStatus::Pending, None));

        match record.status {
            AttemptStatus::Running => Ok(()),
            AttemptStatus::Complete => Err(QueueError::invalid_attempt(id, "already complete")),
            AttemptStatus::Pending | AttemptStatus::Claimed => {
                record.status = AttemptStatus::Running;
                record.started_at = Some(Utc::now());
                self.queue.retain(|queued| queued != id);
                Ok(())
            }
        }
    }

    pub fn definition(&self, id: &str) -> Result<&AttemptDefinition, QueueError> {
        self.attempts
            .get(id)
            .and_then(|record| record.definition.as_ref())
            .ok_or_else(|| QueueError::not_found(ResourceKind::Attempt, id))
    }

    pub fn record(&self, id: &str) -> Option<&AttemptRecord> {
        self.attempts.get(id)
    }

    pub fn status(&self, id: &str) -> Option<AttemptStatus> {
        self.attempts.get(id).map(|record| record.status)
    }

    pub fn add_credential(&mut self, id: impl Into<String>, body: Value) {
        self.credentials.insert(id.into(), body);
    }

    pub fn credential(&self, id: &str) -> Result<&Value, QueueError> {
        self.credentials
            .get(id)
            .ok_or_else(|| QueueError::not_found(ResourceKind::Credential, id))
    }

    pub fn add_dataclip(&mut self, id: impl Into<String>, body: Value) {
        self.dataclips.insert(id.into(), body);
    }

    pub fn dataclip(&self, id: &str) -> Result<&Value, QueueError> {
        self.dataclips
            .get(id)
            .ok_or_else(|| QueueError::not_found(ResourceKind::Dataclip, id))
    }

    fn running(&mut self, id: &str) -> Result<&mut AttemptRecord, QueueError> {
        match self.attempts.get_mut(id) {
            Some(record) if record.status == AttemptStatus::Running => Ok(record),
            Some(record) => Err(QueueError::invalid_attempt(
                id,
                format!("attempt is {}", record.status),
            )),
            None => Err(QueueError::not_found(ResourceKind::Attempt, id)),
        }
    }

    /// Validate and apply a completion; a rejected payload leaves the attempt running
    pub fn complete(&mut self, id: &str, raw: &Value) -> Result<AttemptCompletePayload, QueueError> {
        let record = self.running(id)?;
        let payload = AttemptCompletePayload::from_value(raw)?;
        record.status = AttemptStatus::Complete;
        record.completion = Some(payload.clone());
        record.completed_at = Some(Utc::now());
        Ok(payload)
    }

    pub fn append_log(&mut self, id: &str, log: AttemptLogPayload) -> Result<(), QueueError> {
        self.running(id)?.logs.push(log);
        Ok(())
    }

    pub fn run_complete(&mut self, id: &str, run: RunCompletePayload) -> Result<(), QueueError> {
        self.running(id)?.result = Some(run.output_dataclip);
        Ok(())
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    /// Drop all attempts, resources and queued ids
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
