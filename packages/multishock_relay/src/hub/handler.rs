//! Per-connection WebSocket handling.
//!
//! Each downstream connection gets one reader loop (this task) and one
//! writer task draining the hub-facing outbound channel. Nothing here
//! escalates into the hub: a bad frame is dropped, a dead socket tears
//! down only its own connection.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_protocol::{Envelope, commands};

use super::{ConnectionId, TWITCH_LABEL};
use crate::AppState;
use crate::feeds::Credentials;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_downstream(socket, state))
}

async fn handle_downstream(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to this connection's socket
    let (tx, mut rx) = mpsc::channel::<String>(100);
    let conn_id = state.hub.accept(tx).await;

    let writer_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match Envelope::decode(&text) {
                Ok(envelope) => dispatch(&state, conn_id, envelope).await,
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "dropping malformed envelope")
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong: nothing to do
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "websocket read error, closing");
                break;
            }
        }
    }

    state.hub.disconnect(conn_id).await;
    writer_task.abort();
    info!(conn_id = %conn_id, "downstream connection closed");
}

/// Dispatch one decoded envelope from a downstream connection.
async fn dispatch(state: &AppState, conn_id: ConnectionId, envelope: Envelope) {
    match envelope.cmd.as_str() {
        commands::IDENTIFY => {
            let Some(label) = envelope.value.as_str() else {
                warn!(conn_id = %conn_id, "identify without a string label, ignoring");
                return;
            };
            state.hub.identify(conn_id, label).await;
            state.hub.send_to(conn_id, &Envelope::identified(label)).await;
            // A late-connecting Twitch consumer missed any earlier rotation;
            // bring it up to date with the active credentials.
            if label == TWITCH_LABEL {
                if let Some(credentials) = state.credentials.current().await {
                    let envelope = Envelope::update_credentials(
                        &credentials.username,
                        &credentials.oauth_token,
                    );
                    state.hub.send_to(conn_id, &envelope).await;
                }
            }
        }
        commands::SEND_MESSAGE => {
            let Some(message) = envelope.value.get("message").and_then(|v| v.as_str()) else {
                warn!(conn_id = %conn_id, "send_message without a message field, ignoring");
                return;
            };
            state.supervisor.send_chat(message.to_string()).await;
        }
        commands::UPDATE_CREDENTIALS => {
            let Some(credentials) = Credentials::from_value(&envelope.value) else {
                warn!(conn_id = %conn_id, "update_credentials with missing fields, ignoring");
                return;
            };
            info!(conn_id = %conn_id, username = %credentials.username, "credential rotation requested");
            state.credentials.set(credentials.clone()).await;
            state.supervisor.rotate(credentials).await;
            // Twitch-labelled consumers (external relays) rotate too.
            state.hub.route_to(TWITCH_LABEL, &envelope).await;
        }
        other => {
            warn!(conn_id = %conn_id, cmd = other, "unrecognized command, ignoring");
        }
    }
}
