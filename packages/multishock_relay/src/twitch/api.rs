use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::config::RelayConfig;

/// Outcome of an OAuth token validation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub valid: bool,
    /// Unix seconds at which the token expires, when known.
    pub expires_at: Option<u64>,
}

/// A resolved broadcaster channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub login: String,
}

/// Thin client over the Twitch OAuth and Helix endpoints both feeds depend
/// on at connect time. Debug builds of the config point this at a local
/// mock server instead.
#[derive(Clone)]
pub struct HelixClient {
    http: reqwest::Client,
    client_id: String,
    validate_url: String,
    users_url: String,
    subscriptions_url: String,
}

impl HelixClient {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            validate_url: config.validate_url.clone(),
            users_url: config.users_url.clone(),
            subscriptions_url: config.subscriptions_url.clone(),
        }
    }

    /// Check the token against the OAuth validate endpoint. A non-success
    /// response or a body without `expires_in` means the token is invalid
    /// or expired; that is a normal outcome, not an `Err`.
    pub async fn validate(&self, token: &str) -> Result<TokenStatus> {
        let resp = self
            .http
            .get(&self.validate_url)
            .bearer_auth(token)
            .send()
            .await
            .context("token validation request failed")?;
        if !resp.status().is_success() {
            return Ok(TokenStatus {
                valid: false,
                expires_at: None,
            });
        }
        let body: Value = resp
            .json()
            .await
            .context("token validation response was not JSON")?;
        match body.get("expires_in").and_then(Value::as_u64) {
            Some(expires_in) => Ok(TokenStatus {
                valid: true,
                expires_at: Some(unix_now().saturating_add(expires_in)),
            }),
            None => Ok(TokenStatus {
                valid: false,
                expires_at: None,
            }),
        }
    }

    /// Resolve the broadcaster id for `login` via helix/users.
    pub async fn resolve_channel(&self, token: &str, login: &str) -> Result<Channel> {
        let resp = self
            .http
            .get(&self.users_url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(token)
            .query(&[("login", login)])
            .send()
            .await
            .context("helix users request failed")?;
        let body: Value = resp
            .json()
            .await
            .context("helix users response was not JSON")?;
        Self::channel_from_users_body(&body)
    }

    /// Resolve the login and channel the token itself belongs to (no
    /// `login` query; helix returns the token's own user).
    pub async fn resolve_token_owner(&self, token: &str) -> Result<Channel> {
        let resp = self
            .http
            .get(&self.users_url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(token)
            .send()
            .await
            .context("helix users request failed")?;
        let body: Value = resp
            .json()
            .await
            .context("helix users response was not JSON")?;
        Self::channel_from_users_body(&body)
    }

    /// Create one EventSub subscription bound to a WebSocket session.
    /// Returns the HTTP status; non-2xx is the caller's diagnostic, not an
    /// `Err` — other subscriptions still proceed.
    pub async fn create_subscription(
        &self,
        token: &str,
        kind: &str,
        channel_id: &str,
        session_id: &str,
    ) -> Result<StatusCode> {
        let payload = json!({
            "type": kind,
            "version": "1",
            "condition": {"broadcaster_user_id": channel_id},
            "transport": {"method": "websocket", "session_id": session_id},
        });
        let resp = self
            .http
            .post(&self.subscriptions_url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("eventsub subscription request for {kind} failed"))?;
        debug!(kind, status = %resp.status(), "eventsub subscription response");
        Ok(resp.status())
    }

    fn channel_from_users_body(body: &Value) -> Result<Channel> {
        let user = body
            .get("data")
            .and_then(|d| d.get(0))
            .context("helix users response contained no user")?;
        let id = user
            .get("id")
            .and_then(Value::as_str)
            .context("helix user without an id")?;
        let login = user
            .get("login")
            .and_then(Value::as_str)
            .context("helix user without a login")?;
        Ok(Channel {
            id: id.to_string(),
            login: login.to_string(),
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
