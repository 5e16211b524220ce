//! The structured EventSub feed.
//!
//! Protocol state lives in [`EventSession`], a pure frame → actions
//! machine; `run_event_feed` is the socket driver that interprets those
//! actions. Splitting the two keeps the welcome/keepalive/reconnect rules
//! testable without a socket.

use std::time::Duration;

use futures::StreamExt;
use relay_protocol::{Envelope, EventSubMessage, MessageType, SUBSCRIPTION_KINDS};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Credentials, report_error};
use crate::config::RelayConfig;
use crate::twitch::HelixClient;

/// Bounded wait per socket poll so a stop signal is observed promptly even
/// when the upstream is silent.
const RECV_POLL: Duration = Duration::from_millis(500);

/// What the driver should do in response to one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum EventAction {
    /// Issue one subscription request for this notification kind.
    Subscribe(&'static str),
    /// Forward a normalized envelope to the hub.
    Emit(Envelope),
    /// Reconnect to this URL specifically, keeping existing subscriptions.
    Reconnect(String),
}

/// Protocol state for one EventSub connection lifetime.
///
/// The session id is meaningful only while bound to a specific socket; it
/// is cleared on every reconnect and never reused across sockets.
#[derive(Debug, Default)]
pub struct EventSession {
    session_id: Option<String>,
    /// Set while following a `session_reconnect` URL. The upstream
    /// migrates existing subscriptions to the new socket; subscribing
    /// again would create duplicates.
    resuming: bool,
}

impl EventSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Mark the next welcome as a resumed session (post-reconnect-url).
    pub fn begin_resume(&mut self) {
        self.session_id = None;
        self.resuming = true;
    }

    /// Classify one raw frame into follow-up actions. Keepalives, unknown
    /// message types, and unparsable frames yield nothing.
    pub fn handle_frame(&mut self, text: &str) -> Vec<EventAction> {
        let message = match EventSubMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping unparsable eventsub frame");
                return Vec::new();
            }
        };
        match message.message_type() {
            MessageType::SessionKeepalive | MessageType::Unknown => Vec::new(),
            MessageType::SessionWelcome => {
                self.session_id = message.session_id().map(str::to_string);
                if self.resuming {
                    self.resuming = false;
                    debug!("resumed session, skipping re-subscription");
                    return Vec::new();
                }
                SUBSCRIPTION_KINDS
                    .iter()
                    .map(|kind| EventAction::Subscribe(kind))
                    .collect()
            }
            MessageType::SessionReconnect => match message.reconnect_url() {
                Some(url) => vec![EventAction::Reconnect(url.to_string())],
                None => {
                    warn!("session_reconnect without a url, ignoring");
                    Vec::new()
                }
            },
            MessageType::Notification => {
                let (Some(kind), Some(event)) =
                    (message.subscription_kind(), message.event())
                else {
                    warn!("notification missing subscription type or event, dropping");
                    return Vec::new();
                };
                vec![EventAction::Emit(Envelope::new(kind, event.clone()))]
            }
        }
    }
}

/// How one socket session ended.
enum SessionEnd {
    Stop,
    Reconnect(String),
}

/// Maintain the EventSub session until cancelled or the upstream goes
/// away. Restart-on-failure policy belongs to the supervisor, not here.
pub async fn run_event_feed(
    config: RelayConfig,
    credentials: Credentials,
    events_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    let helix = HelixClient::new(&config);

    // Fail closed: an invalid or expired credential never opens the socket.
    let status = match helix.validate(&credentials.oauth_token).await {
        Ok(status) => status,
        Err(e) => {
            report_error(&events_tx, format!("twitch token validation failed: {e:#}")).await;
            return;
        }
    };
    if !status.valid {
        report_error(
            &events_tx,
            "twitch token is invalid or expired, event feed not started".to_string(),
        )
        .await;
        return;
    }

    let channel = match helix
        .resolve_channel(&credentials.oauth_token, &credentials.username)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            report_error(&events_tx, format!("channel resolution failed: {e:#}")).await;
            return;
        }
    };

    let mut session = EventSession::new();
    let mut url = config.eventsub_ws_url.clone();

    loop {
        let mut socket = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                report_error(&events_tx, format!("eventsub connect to {url} failed: {e}")).await;
                return;
            }
        };
        info!(url = %url, channel = %channel.login, "connected to eventsub websocket");

        let end = 'session: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    break 'session SessionEnd::Stop;
                }
                frame = tokio::time::timeout(RECV_POLL, socket.next()) => {
                    let frame = match frame {
                        Err(_) => continue, // poll expired, re-check cancellation
                        Ok(frame) => frame,
                    };
                    match frame {
                        None => {
                            report_error(&events_tx, "eventsub connection closed by server".to_string()).await;
                            break 'session SessionEnd::Stop;
                        }
                        Some(Err(e)) => {
                            report_error(&events_tx, format!("eventsub read error: {e}")).await;
                            break 'session SessionEnd::Stop;
                        }
                        Some(Ok(Message::Text(text))) => {
                            let actions = session.handle_frame(text.as_str());
                            if let Some(end) = apply_actions(
                                actions,
                                &helix,
                                &credentials,
                                &channel.id,
                                &session,
                                &events_tx,
                            )
                            .await
                            {
                                break 'session end;
                            }
                        }
                        Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    }
                }
            }
        };

        match end {
            SessionEnd::Stop => return,
            SessionEnd::Reconnect(new_url) => {
                info!(url = %new_url, "following eventsub reconnect url");
                url = new_url;
                session.begin_resume();
            }
        }
    }
}

/// Interpret the actions from one frame. Returns how the session should
/// end, if it should.
async fn apply_actions(
    actions: Vec<EventAction>,
    helix: &HelixClient,
    credentials: &Credentials,
    channel_id: &str,
    session: &EventSession,
    events_tx: &mpsc::Sender<Envelope>,
) -> Option<SessionEnd> {
    for action in actions {
        match action {
            EventAction::Emit(envelope) => {
                if events_tx.send(envelope).await.is_err() {
                    // Hub side is gone; no one left to feed.
                    return Some(SessionEnd::Stop);
                }
            }
            EventAction::Subscribe(kind) => {
                let session_id = session.session_id().unwrap_or_default();
                match helix
                    .create_subscription(&credentials.oauth_token, kind, channel_id, session_id)
                    .await
                {
                    Ok(status) if status.is_success() => {
                        debug!(kind, "eventsub subscription created");
                    }
                    // Non-2xx is a diagnostic, not fatal: the remaining
                    // subscriptions still proceed.
                    Ok(status) => {
                        report_error(
                            events_tx,
                            format!("eventsub subscription for {kind} rejected: {status}"),
                        )
                        .await;
                    }
                    Err(e) => {
                        report_error(
                            events_tx,
                            format!("eventsub subscription for {kind} failed: {e:#}"),
                        )
                        .await;
                    }
                }
            }
            EventAction::Reconnect(url) => return Some(SessionEnd::Reconnect(url)),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn welcome(session_id: &str) -> String {
        json!({
            "metadata": {"message_type": "session_welcome"},
            "payload": {"session": {"id": session_id}},
        })
        .to_string()
    }

    #[test]
    fn welcome_subscribes_every_kind_once() {
        let mut session = EventSession::new();
        let actions = session.handle_frame(&welcome("s1"));
        assert_eq!(actions.len(), SUBSCRIPTION_KINDS.len());
        for (action, kind) in actions.iter().zip(SUBSCRIPTION_KINDS) {
            assert_eq!(*action, EventAction::Subscribe(kind));
        }
        assert_eq!(session.session_id(), Some("s1"));
    }

    #[test]
    fn keepalive_yields_nothing() {
        let mut session = EventSession::new();
        let frame = json!({
            "metadata": {"message_type": "session_keepalive"},
            "payload": {},
        })
        .to_string();
        assert!(session.handle_frame(&frame).is_empty());
    }

    #[test]
    fn notification_emits_passthrough_envelope() {
        let mut session = EventSession::new();
        let frame = json!({
            "metadata": {"message_type": "notification"},
            "payload": {
                "subscription": {"type": "channel.cheer"},
                "event": {"bits": 500},
            },
        })
        .to_string();
        let actions = session.handle_frame(&frame);
        assert_eq!(
            actions,
            vec![EventAction::Emit(Envelope::new(
                "channel.cheer",
                json!({"bits": 500})
            ))]
        );
    }

    #[test]
    fn reconnect_carries_the_supplied_url() {
        let mut session = EventSession::new();
        let frame = json!({
            "metadata": {"message_type": "session_reconnect"},
            "payload": {"session": {"reconnect_url": "ws://next/ws"}},
        })
        .to_string();
        assert_eq!(
            session.handle_frame(&frame),
            vec![EventAction::Reconnect("ws://next/ws".to_string())]
        );
    }

    #[test]
    fn welcome_after_resume_does_not_resubscribe() {
        let mut session = EventSession::new();
        session.handle_frame(&welcome("s1"));
        session.begin_resume();
        assert_eq!(session.session_id(), None);

        // the migrated session's welcome must not re-subscribe
        assert!(session.handle_frame(&welcome("s2")).is_empty());
        assert_eq!(session.session_id(), Some("s2"));

        // but a later welcome on a genuinely new session would
        let actions = session.handle_frame(&welcome("s3"));
        assert_eq!(actions.len(), SUBSCRIPTION_KINDS.len());
    }

    #[test]
    fn unparsable_frame_is_dropped() {
        let mut session = EventSession::new();
        assert!(session.handle_frame("not json").is_empty());
    }

    mod e2e {
        use super::super::*;
        use crate::feeds::test_support::{
            expect_envelope, keepalive_frame, notification_frame, reconnect_frame,
            spawn_mock_eventsub, spawn_mock_helix, test_config,
        };
        use serde_json::json;

        fn credentials() -> Credentials {
            Credentials {
                oauth_token: "tok-a".to_string(),
                username: "buwump".to_string(),
            }
        }

        #[tokio::test]
        async fn welcome_subscribes_and_notifications_flow_through() {
            let (helix_url, subs) = spawn_mock_helix().await;
            let eventsub = spawn_mock_eventsub(
                "s1",
                vec![
                    keepalive_frame(),
                    notification_frame("channel.cheer", json!({"bits": 100})),
                ],
            )
            .await;
            let config = test_config(&helix_url, &eventsub.url, "127.0.0.1:1");
            let (events_tx, mut events_rx) = mpsc::channel(64);
            let cancel = CancellationToken::new();

            let task = tokio::spawn(run_event_feed(
                config,
                credentials(),
                events_tx,
                cancel.clone(),
            ));

            // the keepalive produced nothing; the first envelope is the cheer
            let envelope = expect_envelope(&mut events_rx).await;
            assert_eq!(envelope.cmd, "channel.cheer");
            assert_eq!(envelope.value["bits"], 100);

            let recorded = subs.records().await;
            assert_eq!(recorded.len(), SUBSCRIPTION_KINDS.len());
            for record in &recorded {
                assert_eq!(record.token, "tok-a");
                assert_eq!(record.session_id, "s1");
            }

            cancel.cancel();
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("feed did not stop after cancel")
                .unwrap();
        }

        #[tokio::test]
        async fn reconnect_uses_supplied_url_and_skips_resubscription() {
            let (helix_url, subs) = spawn_mock_helix().await;
            let second = spawn_mock_eventsub(
                "s2",
                vec![notification_frame("channel.subscribe", json!({"tier": "1000"}))],
            )
            .await;
            let first = spawn_mock_eventsub("s1", vec![reconnect_frame(&second.url)]).await;
            let config = test_config(&helix_url, &first.url, "127.0.0.1:1");
            let (events_tx, mut events_rx) = mpsc::channel(64);
            let cancel = CancellationToken::new();

            let task = tokio::spawn(run_event_feed(
                config,
                credentials(),
                events_tx,
                cancel.clone(),
            ));

            // a notification from the second server proves the feed followed
            // the supplied url rather than the default
            let envelope = expect_envelope(&mut events_rx).await;
            assert_eq!(envelope.cmd, "channel.subscribe");

            // only the original session subscribed; the migrated one did not
            let recorded = subs.records().await;
            assert_eq!(recorded.len(), SUBSCRIPTION_KINDS.len());
            assert!(recorded.iter().all(|r| r.session_id == "s1"));

            cancel.cancel();
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("feed did not stop after cancel")
                .unwrap();
        }

        #[tokio::test]
        async fn wss_url_dials_with_tls_and_fails_on_the_handshake() {
            use tokio::io::AsyncWriteExt;

            let (helix_url, _subs) = spawn_mock_helix().await;
            // a plain TCP peer that answers the TLS hello with garbage
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let _ = socket.write_all(b"not a tls server\r\n").await;
                }
            });
            let config = test_config(&helix_url, &format!("wss://{addr}/ws"), "127.0.0.1:1");
            let (events_tx, mut events_rx) = mpsc::channel(64);

            run_event_feed(config, credentials(), events_tx, CancellationToken::new()).await;

            // the dial must get as far as a TLS handshake attempt; a build
            // without TLS support would fail before opening the socket at all
            let envelope = expect_envelope(&mut events_rx).await;
            assert_eq!(envelope.cmd, "error");
            let message = envelope.value["message"].as_str().unwrap();
            assert!(message.contains("eventsub connect"), "got: {message}");
            assert!(
                !message.contains("TLS support not compiled in"),
                "got: {message}"
            );
        }

        #[tokio::test]
        async fn invalid_token_never_opens_the_socket() {
            let (helix_url, _subs) = spawn_mock_helix().await;
            // helix mock treats this token as expired
            let credentials = Credentials {
                oauth_token: "expired".to_string(),
                username: "buwump".to_string(),
            };
            // eventsub url points nowhere; the feed must not try to reach it
            let config = test_config(&helix_url, "ws://127.0.0.1:1/ws", "127.0.0.1:1");
            let (events_tx, mut events_rx) = mpsc::channel(64);

            run_event_feed(config, credentials, events_tx, CancellationToken::new()).await;

            let envelope = expect_envelope(&mut events_rx).await;
            assert_eq!(envelope.cmd, "error");
        }
    }
}
