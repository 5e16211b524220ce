//! Loopback mock servers for feed tests: a Helix/OAuth HTTP endpoint, an
//! EventSub WebSocket endpoint, and a chat TCP endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use relay_protocol::Envelope;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};

use crate::config::RelayConfig;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

pub(crate) fn test_config(
    helix_base: &str,
    eventsub_ws_url: &str,
    chat_addr: &str,
) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        client_id: "test-client".to_string(),
        validate_url: format!("{helix_base}/oauth2/validate"),
        users_url: format!("{helix_base}/helix/users"),
        subscriptions_url: format!("{helix_base}/eventsub/subscriptions"),
        eventsub_ws_url: eventsub_ws_url.to_string(),
        chat_addr: chat_addr.to_string(),
    }
}

pub(crate) async fn expect_envelope(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("envelope channel closed")
}

// --- mock Helix / OAuth ----------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct SubRecord {
    pub kind: String,
    pub token: String,
    pub session_id: String,
}

#[derive(Clone, Default)]
pub(crate) struct SubLog(Arc<Mutex<Vec<SubRecord>>>);

impl SubLog {
    pub(crate) async fn records(&self) -> Vec<SubRecord> {
        self.0.lock().await.clone()
    }

    pub(crate) async fn wait_for_count(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.0.lock().await.len() >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} subscription requests"
            );
            tokio::time::sleep(POLL).await;
        }
    }
}

/// Serve validate/users/subscriptions. The token `expired` validates as
/// invalid; everything else is good for an hour.
pub(crate) async fn spawn_mock_helix() -> (String, SubLog) {
    let log = SubLog::default();
    let app = Router::new()
        .route("/oauth2/validate", get(validate))
        .route(
            "/helix/users",
            get(|| async { Json(json!({"data": [{"id": "42", "login": "buwump"}]})) }),
        )
        .route("/eventsub/subscriptions", post(record_subscription))
        .with_state(log.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), log)
}

async fn validate(headers: HeaderMap) -> Response {
    if bearer_token(&headers) == "expired" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"login": "buwump", "expires_in": 3600})).into_response()
}

async fn record_subscription(
    State(log): State<SubLog>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    log.0.lock().await.push(SubRecord {
        kind: body["type"].as_str().unwrap_or_default().to_string(),
        token: bearer_token(&headers),
        session_id: body["transport"]["session_id"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    });
    StatusCode::ACCEPTED
}

fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim_start_matches("Bearer ")
        .to_string()
}

// --- mock EventSub socket --------------------------------------------------

pub(crate) struct MockEventSub {
    pub url: String,
}

#[derive(Clone)]
struct EventSubState {
    session_id: String,
    frames: Arc<Vec<String>>,
}

/// Serve one scripted EventSub endpoint: welcome with `session_id`, then
/// each frame in order, then hold the socket open until the client leaves.
pub(crate) async fn spawn_mock_eventsub(session_id: &str, frames: Vec<String>) -> MockEventSub {
    let state = EventSubState {
        session_id: session_id.to_string(),
        frames: Arc::new(frames),
    };
    let app = Router::new().route("/ws", get(eventsub_ws)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockEventSub {
        url: format!("ws://{addr}/ws"),
    }
}

async fn eventsub_ws(State(state): State<EventSubState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let welcome = json!({
            "metadata": {"message_type": "session_welcome"},
            "payload": {"session": {"id": state.session_id}},
        })
        .to_string();
        if socket.send(Message::Text(welcome.into())).await.is_err() {
            return;
        }
        for frame in state.frames.iter() {
            if socket
                .send(Message::Text(frame.clone().into()))
                .await
                .is_err()
            {
                return;
            }
        }
        while socket.recv().await.is_some() {}
    })
}

pub(crate) fn keepalive_frame() -> String {
    json!({"metadata": {"message_type": "session_keepalive"}, "payload": {}}).to_string()
}

pub(crate) fn notification_frame(kind: &str, event: Value) -> String {
    json!({
        "metadata": {"message_type": "notification"},
        "payload": {"subscription": {"type": kind}, "event": event},
    })
    .to_string()
}

pub(crate) fn reconnect_frame(url: &str) -> String {
    json!({
        "metadata": {"message_type": "session_reconnect"},
        "payload": {"session": {"reconnect_url": url}},
    })
    .to_string()
}

// --- mock chat server ------------------------------------------------------

pub(crate) struct MockChat {
    pub addr: String,
    /// Everything received, one buffer per accepted connection.
    received: Arc<Mutex<Vec<String>>>,
}

impl MockChat {
    pub(crate) async fn connection_count(&self) -> usize {
        self.received.lock().await.len()
    }

    /// Wait until some accepted connection has received `needle`.
    pub(crate) async fn wait_for_connection_containing(&self, needle: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self
                .received
                .lock()
                .await
                .iter()
                .any(|buffer| buffer.contains(needle))
            {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for a chat connection containing {needle:?}"
            );
            tokio::time::sleep(POLL).await;
        }
    }
}

/// Accept chat connections and record everything each one sends.
pub(crate) async fn spawn_mock_chat() -> MockChat {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let received: Arc<Mutex<Vec<String>>> = Arc::default();
    let accept_log = received.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let index = {
                let mut log = accept_log.lock().await;
                log.push(String::new());
                log.len() - 1
            };
            let conn_log = accept_log.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            conn_log.lock().await[index]
                                .push_str(&String::from_utf8_lossy(&buf[..n]));
                        }
                    }
                }
            });
        }
    });
    MockChat { addr, received }
}
