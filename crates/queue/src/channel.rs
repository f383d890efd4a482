//! Channel layer
//!
//! A [`Socket`] is one worker connection. It joins topics and turns inbound
//! frames into replies; a joined [`Channel`] handles the pushes for its topic.

use std::collections::HashSet;
use std::sync::Arc;

use conveyor_core::{
    events, AttemptLogPayload, AttemptStatus, ClaimRequest, Frame, ResourceRequest,
    RunCompletePayload, Topic,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::server::QueueServer;

/// One worker connection
pub struct Socket {
    server: Arc<QueueServer>,
    worker_id: Option<String>,
    joined: HashSet<Topic>,
}

impl Socket {
    pub(crate) fn new(server: Arc<QueueServer>, worker_id: Option<String>) -> Self {
        Self {
            server,
            worker_id,
            joined: HashSet::new(),
        }
    }

    /// Worker id from the connect token, if the server requires one
    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    /// Join a topic
    ///
    /// Attempt topics can only be joined while the attempt is running.
    pub fn join(&mut self, name: &str) -> Result<Channel, QueueError> {
        let topic = match Topic::parse(name) {
            Some(Topic::Phoenix) | None => return Err(QueueError::UnknownTopic(name.to_string())),
            Some(topic) => topic,
        };

        if let Topic::Attempt(id) = &topic {
            match self.server.status(id) {
                Some(AttemptStatus::Running) => {}
                Some(status) => {
                    return Err(QueueError::invalid_attempt(
                        id.as_str(),
                        format!("cannot join a {status} attempt"),
                    ))
                }
                None => return Err(QueueError::invalid_attempt(id.as_str(), "not started")),
            }
        }

        debug!(topic = %topic, worker_id = ?self.worker_id, "joined");
        self.joined.insert(topic.clone());
        Ok(self.channel(topic))
    }

    pub fn leave(&mut self, name: &str) -> bool {
        Topic::parse(name).is_some_and(|topic| self.joined.remove(&topic))
    }

    pub fn is_joined(&self, name: &str) -> bool {
        Topic::parse(name).is_some_and(|topic| self.joined.contains(&topic))
    }

    fn channel(&self, topic: Topic) -> Channel {
        Channel {
            server: Arc::clone(&self.server),
            topic,
            worker_id: self.worker_id.clone(),
        }
    }

    /// Handle one inbound frame; returns the reply to send, if any
    pub fn handle_frame(&mut self, frame: Frame) -> Option<Frame> {
        if frame.is_reply() {
            warn!(topic = %frame.topic, "ignoring reply frame from client");
            return None;
        }

        let outcome = self.dispatch(&frame);
        if let Err(e) = &outcome {
            debug!(topic = %frame.topic, event = %frame.event, code = e.code(), "push rejected");
        }

        let outcome = outcome.map_err(|e| json!(e.to_body()));
        Some(Frame::reply(frame.topic, frame.reference, outcome))
    }

    fn dispatch(&mut self, frame: &Frame) -> Result<Value, QueueError> {
        match frame.event.as_str() {
            events::HEARTBEAT if frame.topic == Topic::Phoenix.to_string() => Ok(json!({})),
            events::JOIN => self.join(&frame.topic).map(|_| json!({})),
            events::LEAVE => {
                self.leave(&frame.topic);
                Ok(json!({}))
            }
            event => {
                let topic = Topic::parse(&frame.topic)
                    .filter(|topic| self.joined.contains(topic))
                    .ok_or_else(|| QueueError::NotJoined(frame.topic.clone()))?;
                self.channel(topic).push(event, frame.payload.clone())
            }
        }
    }
}

/// A joined topic
#[derive(Clone)]
pub struct Channel {
    server: Arc<QueueServer>,
    topic: Topic,
    worker_id: Option<String>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl Channel {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Push an event and return the reply body
    pub fn push(&self, event: &str, payload: Value) -> Result<Value, QueueError> {
        match &self.topic {
            Topic::Workers => self.push_workers(event, payload),
            Topic::Attempt(id) => self.push_attempt(id, event, payload),
            Topic::Phoenix => Err(QueueError::UnknownTopic(self.topic.to_string())),
        }
    }

    fn push_workers(&self, event: &str, payload: Value) -> Result<Value, QueueError> {
        match event {
            events::CLAIM => {
                let request: ClaimRequest = if payload.is_null() {
                    ClaimRequest::default()
                } else {
                    parse(event, payload)?
                };
                let count = request.count.unwrap_or(1);
                let claimed = self.server.claim_many(count, self.worker_id.as_deref());

                // The claimant opens the attempt channel next, so start right away
                for id in &claimed {
                    self.server.start_attempt(id)?;
                }
                Ok(json!(claimed))
            }
            other => Err(QueueError::UnknownEvent(other.to_string())),
        }
    }

    fn push_attempt(&self, id: &str, event: &str, payload: Value) -> Result<Value, QueueError> {
        match event {
            events::GET_ATTEMPT => {
                let definition = self.server.get_attempt(id)?;
                serde_json::to_value(definition).map_err(|e| QueueError::Protocol(e.to_string()))
            }
            events::GET_CREDENTIAL => {
                let request: ResourceRequest = parse(event, payload)?;
                self.server.get_credential(&request.id)
            }
            events::GET_DATACLIP => {
                let request: ResourceRequest = parse(event, payload)?;
                self.server.get_dataclip(&request.id)
            }
            events::ATTEMPT_COMPLETE => {
                self.server.complete_attempt(id, &payload)?;
                Ok(json!({}))
            }
            events::ATTEMPT_LOG => {
                let log: AttemptLogPayload = parse(event, payload)?;
                self.server.log_attempt(id, log)?;
                Ok(json!({}))
            }
            events::RUN_COMPLETE => {
                let run: RunCompletePayload = parse(event, payload)?;
                self.server.run_complete(id, run)?;
                Ok(json!({}))
            }
            other => Err(QueueError::UnknownEvent(other.to_string())),
        }
    }
}

fn parse<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, QueueError> {
    serde_json::from_value(payload)
        .map_err(|e| QueueError::Protocol(format!("invalid {event} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{AttemptDefinition, JobDefinition, ReplyStatus};

    fn server() -> Arc<QueueServer> {
        Arc::new(QueueServer::default())
    }

    fn definition(id: &str) -> AttemptDefinition {
        AttemptDefinition::new(id)
            .with_job(
                JobDefinition::new("job-1", r#"{"data": 1}"#)
                    .with_adaptor("@openfn/language-common@1.0.0")
                    .with_credential("cred-1"),
            )
            .with_dataclip("clip-1")
    }

    #[test]
    fn test_join_requires_running_attempt() {
        let server = server();
        server.enqueue_attempt(definition("a")).unwrap();
        let mut socket = server.connect(None).unwrap();

        let err = socket.join("attempt:a").unwrap_err();
        assert_eq!(err.code(), "invalid_attempt");
        assert_eq!(
            socket.join("attempt:unknown").unwrap_err().code(),
            "invalid_attempt"
        );

        server.start_attempt("a").unwrap();
        let channel = socket.join("attempt:a").unwrap();
        assert_eq!(channel.topic(), &Topic::attempt("a"));
    }

    #[test]
    fn test_get_attempt_returns_the_definition() {
        let server = server();
        server.enqueue_attempt(definition("a")).unwrap();
        server.start_attempt("a").unwrap();

        let mut socket = server.connect(None).unwrap();
        let channel = socket.join("attempt:a").unwrap();
        let reply = channel.push(events::GET_ATTEMPT, Value::Null).unwrap();
        let fetched: AttemptDefinition = serde_json::from_value(reply).unwrap();
        assert_eq!(fetched, definition("a"));
    }

    #[test]
    fn test_get_attempt_of_unregistered_attempt() {
        let server = server();
        server.start_attempt("wibble").unwrap();

        let mut socket = server.connect(None).unwrap();
        let channel = socket.join("attempt:wibble").unwrap();
        let err = channel.push(events::GET_ATTEMPT, Value::Null).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_resources_and_not_found() {
        let server = server();
        server.add_credential("cred-1", json!({ "user": "u" }));
        server.add_dataclip("clip-1", json!({ "data": { "x": 1 } }));
        server.start_attempt("a").unwrap();

        let mut socket = server.connect(None).unwrap();
        let channel = socket.join("attempt:a").unwrap();

        assert_eq!(
            channel
                .push(events::GET_CREDENTIAL, json!({ "id": "cred-1" }))
                .unwrap(),
            json!({ "user": "u" })
        );
        assert_eq!(
            channel
                .push(events::GET_DATACLIP, json!({ "id": "clip-1" }))
                .unwrap(),
            json!({ "data": { "x": 1 } })
        );
        assert_eq!(
            channel
                .push(events::GET_DATACLIP, json!({ "id": "nope" }))
                .unwrap_err()
                .code(),
            "not_found"
        );
        assert_eq!(
            channel
                .push(events::GET_CREDENTIAL, json!({}))
                .unwrap_err()
                .code(),
            "protocol_error"
        );
    }

    #[test]
    fn test_claim_over_workers_channel_starts_attempts() {
        let server = server();
        server.enqueue_attempt(definition("a")).unwrap();
        server.enqueue_attempt(definition("b")).unwrap();
        server.enqueue_attempt(definition("c")).unwrap();

        let mut socket = server.connect(None).unwrap();
        let workers = socket.join("workers").unwrap();

        assert_eq!(workers.push(events::CLAIM, Value::Null).unwrap(), json!(["a"]));
        assert_eq!(
            workers.push(events::CLAIM, json!({ "count": 5 })).unwrap(),
            json!(["b", "c"])
        );
        assert_eq!(workers.push(events::CLAIM, json!({})).unwrap(), json!([]));
        assert_eq!(server.status("b"), Some(AttemptStatus::Running));

        assert!(socket.join("attempt:b").is_ok());
    }

    #[test]
    fn test_completion_is_validated() {
        let server = server();
        server.start_attempt("a").unwrap();
        let mut socket = server.connect(None).unwrap();
        let channel = socket.join("attempt:a").unwrap();

        for bad in [
            json!({ "reason": null, "error_type": null, "error_message": null }),
            json!({ "reason": "success", "error_type": "Error", "error_message": null }),
            json!({ "reason": "fail", "error_type": null, "error_message": "boom" }),
            json!({ "reason": "explode", "error_type": null, "error_message": null }),
            json!({ "reason": "success", "error_type": null, "error_message": null, "extra": 1 }),
        ] {
            let err = channel.push(events::ATTEMPT_COMPLETE, bad.clone()).unwrap_err();
            assert_eq!(err.code(), "validation_error", "payload {bad}");
        }
        assert_eq!(server.status("a"), Some(AttemptStatus::Running));

        channel
            .push(
                events::ATTEMPT_COMPLETE,
                json!({ "reason": "kill", "error_type": "TimeoutError", "error_message": "timed out" }),
            )
            .unwrap();
        assert_eq!(server.status("a"), Some(AttemptStatus::Complete));
    }

    #[test]
    fn test_logs_and_run_complete_are_recorded() {
        let server = server();
        server.start_attempt("a").unwrap();
        let mut socket = server.connect(None).unwrap();
        let channel = socket.join("attempt:a").unwrap();

        channel
            .push(
                events::ATTEMPT_LOG,
                json!({ "job_id": "j", "level": "info", "message": ["hi"], "timestamp": 1 }),
            )
            .unwrap();
        channel
            .push(
                events::RUN_COMPLETE,
                json!({ "job_id": "j", "output_dataclip": { "data": 2 } }),
            )
            .unwrap();

        assert_eq!(server.logs("a").len(), 1);
        assert_eq!(server.result("a"), Some(json!({ "data": 2 })));
    }

    #[test]
    fn test_unknown_events_and_topics() {
        let server = server();
        let mut socket = server.connect(None).unwrap();
        assert_eq!(socket.join("wibble").unwrap_err().code(), "unknown_topic");
        assert_eq!(socket.join("attempt:").unwrap_err().code(), "unknown_topic");

        let workers = socket.join("workers").unwrap();
        assert_eq!(
            workers.push("get_attempt", Value::Null).unwrap_err().code(),
            "unknown_event"
        );
    }

    #[test]
    fn test_handle_frame_replies_with_ref() {
        let server = server();
        server.enqueue_attempt(definition("a")).unwrap();
        let mut socket = server.connect(None).unwrap();

        let reply = socket
            .handle_frame(Frame::new("phoenix", events::HEARTBEAT, json!({})).with_ref("1"))
            .unwrap();
        assert_eq!(reply.reference.as_deref(), Some("1"));
        assert_eq!(reply.reply_payload().unwrap().status, ReplyStatus::Ok);

        // Pushing before joining
        let reply = socket
            .handle_frame(Frame::new("workers", events::CLAIM, Value::Null).with_ref("2"))
            .unwrap();
        let body = reply.reply_payload().unwrap().into_result().unwrap_err();
        assert_eq!(body["reason"], "not_joined");

        socket
            .handle_frame(Frame::new("workers", events::JOIN, json!({})).with_ref("3"))
            .unwrap();
        let reply = socket
            .handle_frame(Frame::new("workers", events::CLAIM, Value::Null).with_ref("4"))
            .unwrap();
        assert_eq!(reply.topic, "workers");
        assert_eq!(
            reply.reply_payload().unwrap().into_result(),
            Ok(json!(["a"]))
        );

        socket
            .handle_frame(Frame::new("workers", events::LEAVE, Value::Null))
            .unwrap();
        assert!(!socket.is_joined("workers"));
    }
}
