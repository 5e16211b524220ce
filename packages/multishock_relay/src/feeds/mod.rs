//! Upstream feed lifecycle: one EventSub feed and one chat feed per
//! credential, supervised as a disposable pair.

pub mod chat_feed;
pub mod event_feed;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use relay_protocol::Envelope;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::warn;

/// The `{token, channel}` pair both feeds authenticate with. Rotation
/// replaces the feed instances bound to it; a live feed's credentials are
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub oauth_token: String,
    pub username: String,
}

impl Credentials {
    /// Extract from an `update_credentials` envelope value. `None` means
    /// the envelope was malformed and should be dropped.
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            username: value.get("username")?.as_str()?.to_string(),
            oauth_token: value.get("oauth_token")?.as_str()?.to_string(),
        })
    }
}

/// The credentials currently driving the feeds, shared with the hub so a
/// late-identifying Twitch consumer can be brought up to date on connect.
#[derive(Clone, Default)]
pub struct SharedCredentials(Arc<RwLock<Option<Credentials>>>);

impl SharedCredentials {
    pub async fn set(&self, credentials: Credentials) {
        *self.0.write().await = Some(credentials);
    }

    pub async fn current(&self) -> Option<Credentials> {
        self.0.read().await.clone()
    }
}

/// Report a feed failure as a diagnostic envelope; whoever consumes the
/// feed channel decides what to do with it.
pub(crate) async fn report_error(events_tx: &mpsc::Sender<Envelope>, message: String) {
    warn!(message = %message, "feed error");
    if events_tx.send(Envelope::error(message)).await.is_err() {
        warn!("feed event channel closed, diagnostic dropped");
    }
}
