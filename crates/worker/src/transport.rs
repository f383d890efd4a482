//! Queue transport
//!
//! [`QueueTransport`] is the worker's view of the channel protocol: join a
//! topic, push an event, await the reply. [`WsTransport`] implements it over a
//! WebSocket:
//!
//! - every push carries a fresh `ref`; replies are matched through a pending map
//! - a single connection task owns the socket, sends heartbeats and reconnects
//!   according to a [`ReconnectPolicy`], re-joining every joined topic
//! - pushes in flight when the link drops fail with [`TransportError::Disconnected`]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::serde_util::millis;
use conveyor_core::{events, generate_worker_token, ChannelErrorBody, Frame, Topic};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::reconnect::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type ReplySender = oneshot::Sender<Result<Value, Value>>;

const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

// ============================================================================
// Types
// ============================================================================

/// Observable state of the link to the queue server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// The link dropped and reconnect attempts are in progress
    Reconnecting,
    /// Closed for good (shut down or out of reconnect attempts)
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("disconnected from queue server")]
    Disconnected,

    #[error("no reply to {event} on {topic} within {timeout_ms}ms")]
    ReplyTimeout {
        topic: String,
        event: String,
        timeout_ms: u64,
    },

    /// The server answered with an error reply
    #[error("{event} rejected ({reason}): {message}")]
    Channel {
        event: String,
        reason: String,
        message: String,
    },

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Error code of a channel rejection
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Channel { reason, .. } => Some(reason),
            _ => None,
        }
    }

    fn rejected(event: &str, body: Value) -> Self {
        let (reason, message) = match serde_json::from_value::<ChannelErrorBody>(body.clone()) {
            Ok(body) => (body.reason, body.message),
            Err(_) => ("unknown".to_string(), body.to_string()),
        };
        Self::Channel {
            event: event.to_string(),
            reason,
            message,
        }
    }
}

/// Request/reply access to the queue server's channels
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn join(&self, topic: &str) -> Result<(), TransportError>;

    async fn leave(&self, topic: &str) -> Result<(), TransportError>;

    /// Push an event and wait for its reply
    async fn push(&self, topic: &str, event: &str, payload: Value)
        -> Result<Value, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the queue server (`ws://host:port`)
    pub url: String,
    pub worker_id: String,
    pub worker_secret: Option<String>,
    pub reply_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            worker_id: worker_id.into(),
            worker_secret: None,
            reply_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Socket endpoint, with a freshly signed token when a secret is set
    fn endpoint(&self) -> Result<String, TransportError> {
        let base = format!("{}/worker", self.url.trim_end_matches('/'));
        match &self.worker_secret {
            None => Ok(base),
            Some(secret) => {
                let token = generate_worker_token(secret, &self.worker_id, TOKEN_LIFETIME)
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                Ok(format!("{base}?token={token}"))
            }
        }
    }
}

// ============================================================================
// WebSocket transport
// ============================================================================

struct Shared {
    pending: Mutex<HashMap<String, ReplySender>>,
    joined: Mutex<HashSet<String>>,
    next_ref: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn resolve(&self, frame: Frame) {
        if !frame.is_reply() {
            debug!(topic = %frame.topic, event = %frame.event, "ignoring server push");
            return;
        }
        let Some(sender) = frame
            .reference
            .as_ref()
            .and_then(|reference| self.pending.lock().remove(reference))
        else {
            debug!(topic = %frame.topic, reference = ?frame.reference, "unsolicited reply");
            return;
        };

        let outcome = match frame.reply_payload() {
            Some(reply) => reply.into_result(),
            None => Err(json!({ "reason": "protocol_error", "message": "malformed reply" })),
        };
        // The caller may have timed out already
        let _ = sender.send(outcome);
    }

    /// Drop every pending reply; waiting callers see a disconnect
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

pub struct WsTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
}

impl WsTransport {
    /// Connect to the queue server; the first connection must succeed
    #[instrument(skip_all, fields(url = %config.url, worker_id = %config.worker_id))]
    pub async fn connect(config: TransportConfig) -> Result<Self, TransportError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            joined: Mutex::new(HashSet::new()),
            next_ref: AtomicU64::new(1),
            state,
        });

        let ws = open(&config).await?;
        shared.set_state(ConnectionState::Connected);
        info!("connected to queue server");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_connection(
            config.clone(),
            Arc::clone(&shared),
            ws,
            outgoing_rx,
            shutdown_rx,
        ));

        Ok(Self {
            config,
            shared,
            outgoing,
            shutdown,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Topics that will be re-joined after a reconnect
    pub fn joined_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared.joined.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Close the connection; pending pushes fail
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl QueueTransport for WsTransport {
    async fn join(&self, topic: &str) -> Result<(), TransportError> {
        self.push(topic, events::JOIN, json!({})).await?;
        self.shared.joined.lock().insert(topic.to_string());
        Ok(())
    }

    async fn leave(&self, topic: &str) -> Result<(), TransportError> {
        self.shared.joined.lock().remove(topic);
        self.push(topic, events::LEAVE, json!({})).await.map(|_| ())
    }

    async fn push(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<Value, TransportError> {
        let reference = self.shared.next_ref();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(reference.clone(), tx);

        let frame = Frame::new(topic, event, payload).with_ref(reference.clone());
        if self.outgoing.send(frame).is_err() {
            self.shared.pending.lock().remove(&reference);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(body))) => Err(TransportError::rejected(event, body)),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().remove(&reference);
                Err(TransportError::ReplyTimeout {
                    topic: topic.to_string(),
                    event: event.to_string(),
                    timeout_ms: millis(self.config.reply_timeout),
                })
            }
        }
    }
}

// ============================================================================
// Connection task
// ============================================================================

async fn open(config: &TransportConfig) -> Result<WsStream, TransportError> {
    let endpoint = config.endpoint()?;
    let (ws, _) = connect_async(endpoint.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    Ok(ws)
}

async fn run_connection(
    config: TransportConfig,
    shared: Arc<Shared>,
    mut ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let closed = pump(&config, &shared, ws, &mut outgoing, &mut shutdown).await;

        // Frames queued for the dead link belong to callers that are about to fail
        while outgoing.try_recv().is_ok() {}
        shared.fail_pending();

        if closed || *shutdown.borrow() {
            break;
        }

        warn!("lost connection to queue server");
        match reconnect(&config, &shared, &mut shutdown).await {
            Some(next) => ws = next,
            None => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    outgoing.close();
    shared.fail_pending();
    info!("disconnected from queue server");
}

/// Move frames until the link drops (`false`) or the transport closes (`true`)
async fn pump(
    config: &TransportConfig,
    shared: &Shared,
    ws: WsStream,
    outgoing: &mut mpsc::UnboundedReceiver<Frame>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut sink, mut stream) = ws.split();

    let topics: Vec<String> = shared.joined.lock().iter().cloned().collect();
    for topic in topics {
        debug!(topic = %topic, "re-joining");
        let frame = Frame::new(topic, events::JOIN, json!({})).with_ref(shared.next_ref());
        if send(&mut sink, &frame).await.is_err() {
            return false;
        }
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval.max(MIN_HEARTBEAT));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = send(&mut sink, &frame).await {
                        debug!("send failed: {}", e);
                        return false;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return true;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => shared.resolve(frame),
                    Err(e) => warn!("ignoring malformed frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket error: {}", e);
                    return false;
                }
            },
            _ = heartbeat.tick() => {
                let frame = Frame::new(Topic::Phoenix.to_string(), events::HEARTBEAT, json!({}))
                    .with_ref(shared.next_ref());
                if send(&mut sink, &frame).await.is_err() {
                    return false;
                }
            }
            _ = shutdown.changed() => {
                let _ = sink.close().await;
                return true;
            }
        }
    }
}

async fn send(sink: &mut WsSink, frame: &Frame) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame).map_err(|e| TransportError::Encode(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|_| TransportError::Disconnected)
}

async fn reconnect(
    config: &TransportConfig,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    shared.set_state(ConnectionState::Reconnecting);
    let mut attempt = 0;
    loop {
        attempt += 1;
        if !config.reconnect.allows(attempt) {
            warn!(attempts = attempt - 1, "giving up reconnecting");
            return None;
        }

        let delay = config.reconnect.delay_for_attempt(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return None,
        }

        match open(config).await {
            Ok(ws) => {
                info!(attempt, "reconnected to queue server");
                shared.set_state(ConnectionState::Connected);
                return Some(ws);
            }
            Err(e) => warn!(attempt, "reconnect failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_carries_reason() {
        let err = TransportError::rejected(
            "get_attempt",
            json!({ "reason": "not_found", "message": "attempt not found: a" }),
        );
        assert_eq!(err.reason(), Some("not_found"));
        assert_eq!(
            err.to_string(),
            "get_attempt rejected (not_found): attempt not found: a"
        );

        let err = TransportError::rejected("claim", json!("nope"));
        assert_eq!(err.reason(), Some("unknown"));
    }

    #[test]
    fn test_endpoint_signs_a_token() {
        let config = TransportConfig::new("ws://queue:8888/", "w-1");
        assert_eq!(config.endpoint().unwrap(), "ws://queue:8888/worker");

        let mut config = config;
        config.worker_secret = Some("s3cret".to_string());
        let endpoint = config.endpoint().unwrap();
        let token = endpoint.split("?token=").nth(1).unwrap();
        let claims = conveyor_core::verify_worker_token("s3cret", token).unwrap();
        assert_eq!(claims.worker_id, "w-1");
    }

    #[test]
    fn test_replies_resolve_pending_pushes() {
        let (state, _) = watch::channel(ConnectionState::Connected);
        let shared = Shared {
            pending: Mutex::new(HashMap::new()),
            joined: Mutex::new(HashSet::new()),
            next_ref: AtomicU64::new(1),
            state,
        };
        let (tx, mut rx) = oneshot::channel();
        shared.pending.lock().insert("7".to_string(), tx);

        // Unknown refs are ignored
        shared.resolve(Frame::reply("workers", Some("8".to_string()), Ok(json!(1))));
        assert!(rx.try_recv().is_err());

        shared.resolve(Frame::reply("workers", Some("7".to_string()), Ok(json!([]))));
        assert_eq!(rx.try_recv().unwrap(), Ok(json!([])));
        assert!(shared.pending.lock().is_empty());
    }
}
