//! Twitch EventSub WebSocket message shapes.
//!
//! Consumed, never produced: `{"metadata": {"message_type": ...},
//! "payload": {...}}` with the payload fields meaningful per message type.
//! Event payloads stay opaque `serde_json::Value`s all the way to the
//! downstream consumer.

use serde::Deserialize;
use serde_json::Value;

/// The fixed set of notification kinds the event feed subscribes to after
/// every fresh session welcome.
pub const SUBSCRIPTION_KINDS: [&str; 9] = [
    "channel.cheer",
    "channel.subscribe",
    "channel.subscription.gift",
    "channel.follow",
    "channel.raid",
    "channel.hype_train.begin",
    "channel.hype_train.progress",
    "channel.hype_train.end",
    "channel.channel_points_custom_reward_redemption.add",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SessionWelcome,
    SessionKeepalive,
    SessionReconnect,
    Notification,
    /// Anything this relay has no handling for; discarded, not an error.
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    message_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct Session {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    session: Option<Session>,
    #[serde(default)]
    subscription: Option<Subscription>,
    #[serde(default)]
    event: Option<Value>,
}

/// One inbound message from the EventSub socket.
#[derive(Debug, Deserialize)]
pub struct EventSubMessage {
    metadata: Metadata,
    #[serde(default)]
    payload: Payload,
}

impl EventSubMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn message_type(&self) -> MessageType {
        match self.metadata.message_type.as_str() {
            "session_welcome" => MessageType::SessionWelcome,
            "session_keepalive" => MessageType::SessionKeepalive,
            "session_reconnect" => MessageType::SessionReconnect,
            "notification" => MessageType::Notification,
            _ => MessageType::Unknown,
        }
    }

    /// Session id from a `session_welcome` payload.
    pub fn session_id(&self) -> Option<&str> {
        self.payload.session.as_ref()?.id.as_deref()
    }

    /// Replacement socket URL from a `session_reconnect` payload.
    pub fn reconnect_url(&self) -> Option<&str> {
        self.payload.session.as_ref()?.reconnect_url.as_deref()
    }

    /// Subscription type of a `notification` payload.
    pub fn subscription_kind(&self) -> Option<&str> {
        self.payload.subscription.as_ref().map(|s| s.kind.as_str())
    }

    /// Provider-defined event payload of a `notification`, passed through
    /// opaquely.
    pub fn event(&self) -> Option<&Value> {
        self.payload.event.as_ref()
    }
}
