// HTTP surface of the queue server
// Decision: Workers speak the channel protocol over a single WebSocket at /worker
// Decision: The REST routes are an operator/dev surface (enqueue, inspect, seed resources)

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conveyor_core::{AttemptDefinition, Frame};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::channel::Socket;
use crate::error::QueueError;
use crate::server::QueueServer;
use crate::state::AttemptRecord;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
    reason: &'static str,
}

impl From<QueueError> for (StatusCode, Json<ErrorResponse>) {
    fn from(error: QueueError) -> Self {
        let status = match &error {
            QueueError::NotFound { .. } => StatusCode::NOT_FOUND,
            QueueError::InvalidAttempt { .. } => StatusCode::CONFLICT,
            QueueError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            QueueError::Validation(_)
            | QueueError::UnknownEvent(_)
            | QueueError::UnknownTopic(_)
            | QueueError::NotJoined(_)
            | QueueError::Protocol(_) => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                reason: error.code(),
            }),
        )
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Build the router for a queue server
pub fn router(server: Arc<QueueServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/worker", get(worker_socket))
        .route("/attempts", post(enqueue_attempt))
        .route("/attempts/:id", get(get_attempt))
        .route("/credentials/:id", post(put_credential))
        .route("/dataclips/:id", post(put_dataclip))
        .route("/queue", get(queue_status))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// Worker socket
// ============================================================================

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

async fn worker_socket(
    State(server): State<Arc<QueueServer>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match server.connect(params.token.as_deref()) {
        Ok(socket) => ws.on_upgrade(move |ws| serve_socket(ws, socket)),
        Err(e) => <(StatusCode, Json<ErrorResponse>)>::from(e).into_response(),
    }
}

/// Pump frames between the WebSocket and the channel socket until either side closes
async fn serve_socket(mut ws: WebSocket, mut socket: Socket) {
    info!(worker_id = ?socket.worker_id(), "worker connected");

    while let Some(message) = ws.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(e) => {
                debug!("websocket error: {}", e);
                break;
            }
        };

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("ignoring malformed frame: {}", e);
                continue;
            }
        };

        let Some(reply) = socket.handle_frame(frame) else {
            continue;
        };
        let encoded = match serde_json::to_string(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("failed to encode reply: {}", e);
                continue;
            }
        };
        if ws.send(Message::Text(encoded)).await.is_err() {
            break;
        }
    }

    info!(worker_id = ?socket.worker_id(), "worker disconnected");
}

// ============================================================================
// REST
// ============================================================================

async fn enqueue_attempt(
    State(server): State<Arc<QueueServer>>,
    Json(definition): Json<AttemptDefinition>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = definition.id.clone();
    server.enqueue_attempt(definition)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn get_attempt(
    State(server): State<Arc<QueueServer>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AttemptRecord>> {
    server
        .attempt(&id)
        .map(Json)
        .ok_or_else(|| QueueError::not_found(crate::error::ResourceKind::Attempt, id).into())
}

async fn put_credential(
    State(server): State<Arc<QueueServer>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    server.add_credential(id, body);
    StatusCode::NO_CONTENT
}

async fn put_dataclip(
    State(server): State<Arc<QueueServer>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    server.add_dataclip(id, body);
    StatusCode::NO_CONTENT
}

async fn queue_status(State(server): State<Arc<QueueServer>>) -> Json<Value> {
    Json(json!({ "length": server.queue_length() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(Arc::new(QueueServer::default()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enqueue_and_inspect() {
        let server = Arc::new(QueueServer::default());
        let app = router(Arc::clone(&server));

        let response = app
            .clone()
            .oneshot(post_json("/attempts", json!({ "id": "a", "jobs": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post_json("/attempts", json!({ "id": "a" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(Request::get("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "length": 1 }));

        let response = app
            .clone()
            .oneshot(Request::get("/attempts/a").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let record = body_json(response).await;
        assert_eq!(record["status"], "pending");

        let response = app
            .oneshot(Request::get("/attempts/zzz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["reason"], "not_found");
    }

    #[tokio::test]
    async fn test_seed_resources() {
        let server = Arc::new(QueueServer::default());
        let app = router(Arc::clone(&server));

        let response = app
            .clone()
            .oneshot(post_json("/credentials/c1", json!({ "token": "t" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app
            .oneshot(post_json("/dataclips/d1", json!({ "data": {} })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert_eq!(server.get_credential("c1").unwrap(), json!({ "token": "t" }));
        assert!(server.get_dataclip("d1").is_ok());
    }
}
