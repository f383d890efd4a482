//! Queue server
//!
//! Thread-safe facade over [`QueueState`]. Every operation takes the state
//! lock once, applies a transition and publishes a [`ServerEvent`].

use std::sync::Arc;

use conveyor_core::{
    verify_worker_token, AttemptCompletePayload, AttemptDefinition, AttemptLogPayload,
    AttemptStatus, RunCompletePayload,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::Socket;
use crate::error::QueueError;
use crate::state::{AttemptRecord, QueueState};

const EVENT_CAPACITY: usize = 1024;

/// Notifications about attempt progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AttemptEnqueued {
        id: String,
    },
    AttemptClaimed {
        id: String,
        worker_id: Option<String>,
    },
    AttemptStarted {
        id: String,
    },
    AttemptLog {
        id: String,
        log: AttemptLogPayload,
    },
    RunComplete {
        id: String,
        job_id: String,
    },
    AttemptComplete {
        id: String,
        payload: AttemptCompletePayload,
    },
}

pub struct QueueServer {
    state: Mutex<QueueState>,
    events: broadcast::Sender<ServerEvent>,
    worker_secret: Option<String>,
}

impl Default for QueueServer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl QueueServer {
    /// Create a server; sockets must present a valid token when a secret is set
    pub fn new(worker_secret: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(QueueState::new()),
            events,
            worker_secret,
        }
    }

    fn publish(&self, event: ServerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Open a socket, verifying the worker token when a secret is configured
    pub fn connect(self: &Arc<Self>, token: Option<&str>) -> Result<Socket, QueueError> {
        let worker_id = match (&self.worker_secret, token) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(QueueError::Unauthorized("missing worker token".to_string()))
            }
            (Some(secret), Some(token)) => {
                let claims = verify_worker_token(secret, token).map_err(|e| {
                    warn!("rejected worker token: {}", e);
                    QueueError::Unauthorized(e.to_string())
                })?;
                Some(claims.worker_id)
            }
        };

        debug!(worker_id = ?worker_id, "socket connected");
        Ok(Socket::new(Arc::clone(self), worker_id))
    }

    // ========================================================================
    // Queue
    // ========================================================================

    pub fn enqueue_attempt(&self, definition: AttemptDefinition) -> Result<(), QueueError> {
        let id = definition.id.clone();
        self.state.lock().enqueue(definition)?;
        info!(attempt_id = %id, "attempt enqueued");
        self.publish(ServerEvent::AttemptEnqueued { id });
        Ok(())
    }

    pub fn register_attempt(&self, definition: AttemptDefinition) -> Result<(), QueueError> {
        self.state.lock().register(definition)
    }

    /// Claim the head of the queue (empty when nothing is pending)
    pub fn claim(&self) -> Vec<String> {
        self.claim_many(1, None)
    }

    /// Claim up to `count` attempts; never waits
    pub fn claim_many(&self, count: usize, worker_id: Option<&str>) -> Vec<String> {
        let claimed = self.state.lock().claim(count, worker_id);
        for id in &claimed {
            debug!(attempt_id = %id, worker_id = ?worker_id, "attempt claimed");
            self.publish(ServerEvent::AttemptClaimed {
                id: id.clone(),
                worker_id: worker_id.map(str::to_string),
            });
        }
        claimed
    }

    pub fn start_attempt(&self, id: &str) -> Result<(), QueueError> {
        let newly_started = {
            let mut state = self.state.lock();
            let before = state.status(id);
            state.start(id)?;
            before != Some(AttemptStatus::Running)
        };
        if newly_started {
            info!(attempt_id = %id, "attempt started");
            self.publish(ServerEvent::AttemptStarted { id: id.to_string() });
        }
        Ok(())
    }

    // ========================================================================
    // Resources
    // ========================================================================

    pub fn get_attempt(&self, id: &str) -> Result<AttemptDefinition, QueueError> {
        self.state.lock().definition(id).cloned()
    }

    pub fn add_credential(&self, id: impl Into<String>, body: Value) {
        self.state.lock().add_credential(id, body);
    }

    pub fn get_credential(&self, id: &str) -> Result<Value, QueueError> {
        self.state.lock().credential(id).cloned()
    }

    pub fn add_dataclip(&self, id: impl Into<String>, body: Value) {
        self.state.lock().add_dataclip(id, body);
    }

    pub fn get_dataclip(&self, id: &str) -> Result<Value, QueueError> {
        self.state.lock().dataclip(id).cloned()
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Validate and record an attempt's terminal outcome
    pub fn complete_attempt(
        &self,
        id: &str,
        raw: &Value,
    ) -> Result<AttemptCompletePayload, QueueError> {
        let payload = self.state.lock().complete(id, raw).inspect_err(|e| {
            warn!(attempt_id = %id, "rejected completion: {}", e);
        })?;
        info!(attempt_id = %id, reason = %payload.reason, "attempt complete");
        self.publish(ServerEvent::AttemptComplete {
            id: id.to_string(),
            payload: payload.clone(),
        });
        Ok(payload)
    }

    pub fn log_attempt(&self, id: &str, log: AttemptLogPayload) -> Result<(), QueueError> {
        self.state.lock().append_log(id, log.clone())?;
        self.publish(ServerEvent::AttemptLog {
            id: id.to_string(),
            log,
        });
        Ok(())
    }

    pub fn run_complete(&self, id: &str, run: RunCompletePayload) -> Result<(), QueueError> {
        let job_id = run.job_id.clone();
        self.state.lock().run_complete(id, run)?;
        debug!(attempt_id = %id, job_id = %job_id, "run complete");
        self.publish(ServerEvent::RunComplete {
            id: id.to_string(),
            job_id,
        });
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn queue_length(&self) -> usize {
        self.state.lock().queue_length()
    }

    pub fn status(&self, id: &str) -> Option<AttemptStatus> {
        self.state.lock().status(id)
    }

    /// Latest output dataclip of an attempt
    pub fn result(&self, id: &str) -> Option<Value> {
        self.state
            .lock()
            .record(id)
            .and_then(|record| record.result.clone())
    }

    pub fn logs(&self, id: &str) -> Vec<AttemptLogPayload> {
        self.state
            .lock()
            .record(id)
            .map(|record| record.logs.clone())
            .unwrap_or_default()
    }

    pub fn completion(&self, id: &str) -> Option<AttemptCompletePayload> {
        self.state
            .lock()
            .record(id)
            .and_then(|record| record.completion.clone())
    }

    pub fn attempt(&self, id: &str) -> Option<AttemptRecord> {
        self.state.lock().record(id).cloned()
    }

    pub fn reset(&self) {
        self.state.lock().reset();
        info!("queue reset");
    }
}
