//! Channel protocol frames
//!
//! Every message between a worker and the queue server is a [`Frame`]:
//! `{topic, event, payload, ref}`. A push that expects an answer carries a
//! `ref`; the server answers with a `phx_reply` frame echoing it and a payload of
//! `{status: "ok" | "error", response}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names used on the channels
pub mod events {
    /// Shared channel: pop the next pending attempt ids
    pub const CLAIM: &str = "claim";
    /// Attempt channel: fetch the attempt definition
    pub const GET_ATTEMPT: &str = "get_attempt";
    /// Attempt channel: fetch a credential by id
    pub const GET_CREDENTIAL: &str = "get_credential";
    /// Attempt channel: fetch a dataclip by id
    pub const GET_DATACLIP: &str = "get_dataclip";
    /// Attempt channel: report the terminal outcome
    pub const ATTEMPT_COMPLETE: &str = "attempt_complete";
    /// Attempt channel: stream a log line
    pub const ATTEMPT_LOG: &str = "attempt_log";
    /// Attempt channel: report a job's output dataclip
    pub const RUN_COMPLETE: &str = "run_complete";

    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const HEARTBEAT: &str = "heartbeat";
}

const WORKERS_TOPIC: &str = "workers";
const ATTEMPT_TOPIC_PREFIX: &str = "attempt:";
const PHOENIX_TOPIC: &str = "phoenix";

/// A channel topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Shared queue channel every worker joins
    Workers,
    /// Channel scoped to one started attempt
    Attempt(String),
    /// Connection-level topic used for heartbeats
    Phoenix,
}

impl Topic {
    pub fn attempt(id: impl Into<String>) -> Self {
        Self::Attempt(id.into())
    }

    /// Parse a topic name; `None` for unknown topics
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            WORKERS_TOPIC => Some(Self::Workers),
            PHOENIX_TOPIC => Some(Self::Phoenix),
            other => other
                .strip_prefix(ATTEMPT_TOPIC_PREFIX)
                .filter(|id| !id.is_empty())
                .map(|id| Self::Attempt(id.to_string())),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workers => f.write_str(WORKERS_TOPIC),
            Self::Attempt(id) => write!(f, "{ATTEMPT_TOPIC_PREFIX}{id}"),
            Self::Phoenix => f.write_str(PHOENIX_TOPIC),
        }
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Build the reply to a push
    pub fn reply(
        topic: impl Into<String>,
        reference: Option<String>,
        outcome: Result<Value, Value>,
    ) -> Self {
        let payload = match outcome {
            Ok(response) => ReplyPayload {
                status: ReplyStatus::Ok,
                response,
            },
            Err(response) => ReplyPayload {
                status: ReplyStatus::Error,
                response,
            },
        };
        Self {
            topic: topic.into(),
            event: events::REPLY.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            reference,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.event == events::REPLY
    }

    /// Interpret this frame as a reply payload
    pub fn reply_payload(&self) -> Option<ReplyPayload> {
        if !self.is_reply() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn into_result(self) -> Result<Value, Value> {
        match self.status {
            ReplyStatus::Ok => Ok(self.response),
            ReplyStatus::Error => Err(self.response),
        }
    }
}

/// Error response body: a stable machine-readable reason plus a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelErrorBody {
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Payload of `claim`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// How many attempts to claim (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// Payload of `get_credential` / `get_dataclip`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: String,
}

/// Payload of `attempt_log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLogPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub level: String,
    pub message: Value,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Payload of `run_complete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompletePayload {
    pub job_id: String,
    pub output_dataclip: Value,
}
