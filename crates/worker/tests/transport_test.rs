//! WebSocket transport against a scripted server

use std::time::Duration;

use conveyor_core::{events, Frame};
use conveyor_worker::{
    ConnectionState, QueueTransport, ReconnectPolicy, TransportConfig, TransportError, WsTransport,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Replies `ok` to every push; the first connection is dropped right after its first join
async fn flaky_server(drop_first: bool) -> (String, mpsc::UnboundedReceiver<(usize, Frame)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for connection in 0usize.. {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let frame: Frame = serde_json::from_str(&text).unwrap();
                    let _ = seen_tx.send((connection, frame.clone()));
                    let is_join = frame.event == events::JOIN;
                    let reply = Frame::reply(frame.topic, frame.reference, Ok(json!({})));
                    if ws
                        .send(Message::Text(serde_json::to_string(&reply).unwrap()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if drop_first && connection == 0 && is_join {
                        break;
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), seen_rx)
}

fn config(url: &str) -> TransportConfig {
    TransportConfig::new(url, "worker-1")
        .with_reply_timeout(Duration::from_secs(5))
        .with_reconnect(
            ReconnectPolicy::default()
                .with_initial_interval(Duration::from_millis(10))
                .with_max_interval(Duration::from_millis(50))
                .with_jitter(0.0),
        )
}

async fn next_join(seen: &mut mpsc::UnboundedReceiver<(usize, Frame)>) -> (usize, String) {
    loop {
        let (connection, frame) = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("server saw nothing")
            .unwrap();
        if frame.event == events::JOIN {
            return (connection, frame.topic);
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_reconnect_rejoins_topics() {
    let (url, mut seen) = flaky_server(true).await;
    let transport = WsTransport::connect(config(&url)).await.unwrap();

    transport.join("workers").await.unwrap();
    assert_eq!(next_join(&mut seen).await, (0, "workers".to_string()));

    // The server drops the link; the transport comes back and re-joins
    assert_eq!(next_join(&mut seen).await, (1, "workers".to_string()));

    let mut state = transport.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let reply = transport.push("workers", events::CLAIM, json!({})).await;
    assert_eq!(reply, Ok(json!({})));
    assert_eq!(transport.joined_topics(), vec!["workers"]);
}

#[tokio::test]
async fn test_gives_up_without_reconnect_attempts() {
    let (url, mut seen) = flaky_server(true).await;
    let transport = WsTransport::connect(config(&url).with_reconnect(ReconnectPolicy::never()))
        .await
        .unwrap();

    transport.join("workers").await.unwrap();
    next_join(&mut seen).await;

    let mut state = transport.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    let result = transport.push("workers", events::CLAIM, json!({})).await;
    assert!(
        matches!(
            result,
            Err(TransportError::Closed) | Err(TransportError::Disconnected)
        ),
        "{result:?}"
    );
}

#[tokio::test]
async fn test_heartbeats_are_sent() {
    let (url, mut seen) = flaky_server(false).await;
    let _transport = WsTransport::connect(
        config(&url).with_heartbeat_interval(Duration::from_millis(20)),
    )
    .await
    .unwrap();

    let (_, frame) = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.topic, "phoenix");
    assert_eq!(frame.event, events::HEARTBEAT);
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = WsTransport::connect(config(&format!("ws://{addr}"))).await;
    assert!(matches!(result, Err(TransportError::Connect(_))));
}
