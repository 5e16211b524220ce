//! The `{cmd, value}` envelope carried on every hub boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Recognized `cmd` values on the hub wire. EventSub subscription types
/// (`channel.cheer`, ...) are also valid commands, passed through opaquely.
pub mod commands {
    pub const IDENTIFY: &str = "identify";
    pub const IDENTIFIED: &str = "identified";
    pub const UPDATE_CREDENTIALS: &str = "update_credentials";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const ERROR: &str = "error";
}

/// Errors produced while decoding a wire frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has an empty cmd field")]
    EmptyCommand,
}

/// One message on the wire: a command name and a command-defined argument.
///
/// Created at every produce/consume boundary, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: String,
    #[serde(default)]
    pub value: Value,
}

impl Envelope {
    pub fn new(cmd: impl Into<String>, value: Value) -> Self {
        Self {
            cmd: cmd.into(),
            value,
        }
    }

    /// Decode one text frame. An empty `cmd` is rejected along with
    /// unparsable JSON; callers drop and log, they do not crash.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_str(text)?;
        if envelope.cmd.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }
        Ok(envelope)
    }

    /// Serialize to the wire form. Building through `json!` keeps this
    /// infallible: both fields are already JSON values.
    pub fn encode(&self) -> String {
        json!({"cmd": self.cmd, "value": self.value}).to_string()
    }

    /// Ack sent back to a connection that completed the identify handshake.
    pub fn identified(label: &str) -> Self {
        Self::new(commands::IDENTIFIED, Value::String(label.to_string()))
    }

    pub fn identify(label: &str) -> Self {
        Self::new(commands::IDENTIFY, Value::String(label.to_string()))
    }

    pub fn chat_message(username: &str, message: &str) -> Self {
        Self::new(
            commands::CHAT_MESSAGE,
            json!({"username": username, "message": message}),
        )
    }

    pub fn send_message(message: &str) -> Self {
        Self::new(commands::SEND_MESSAGE, json!({"message": message}))
    }

    pub fn update_credentials(username: &str, oauth_token: &str) -> Self {
        Self::new(
            commands::UPDATE_CREDENTIALS,
            json!({"username": username, "oauth_token": oauth_token}),
        )
    }

    /// Diagnostic envelope delivered to whichever consumer can react.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(commands::ERROR, json!({"message": message.into()}))
    }
}
