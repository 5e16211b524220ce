use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [twitch]
//                    oauth_token = "..."
//
//   env var:         MSHOCK_TWITCH__OAUTH_TOKEN=...   (double underscore = nesting)
//
//   CLI:             --oauth-token ...                (wins over both)

// Real Twitch endpoints. Debug mode swaps the whole set for a local mock.
const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const USERS_URL: &str = "https://api.twitch.tv/helix/users";
const SUBSCRIPTIONS_URL: &str = "https://api.twitch.tv/helix/eventsub/subscriptions";
const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const CHAT_ADDR: &str = "irc.chat.twitch.tv:6667";

const DEBUG_VALIDATE_URL: &str = "http://localhost:8080/oauth2/validate";
const DEBUG_USERS_URL: &str = "http://localhost:8080/helix/users";
const DEBUG_SUBSCRIPTIONS_URL: &str = "http://localhost:8080/eventsub/subscriptions";
const DEBUG_EVENTSUB_WS_URL: &str = "ws://localhost:8080/ws";
const DEBUG_CHAT_ADDR: &str = "localhost:6667";

/// Twitch application id registered for the MultiShock integration.
const DEFAULT_CLIENT_ID: &str = "2usq7xnhsujju3ezja2nzb5j7vtd84";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub twitch: TwitchFileConfig,
}

/// Downstream server knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Twitch-side knobs (lives under `[twitch]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TwitchFileConfig {
    /// Bearer credential for both feeds. Required; there is no default.
    #[serde(default)]
    pub oauth_token: Option<String>,
    /// Channel login the token belongs to. Resolved from the token at
    /// startup when unset.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Point both feeds and the Helix client at local mock endpoints.
    #[serde(default)]
    pub debug: bool,
}

impl Default for TwitchFileConfig {
    fn default() -> Self {
        Self {
            oauth_token: None,
            username: None,
            client_id: default_client_id(),
            debug: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

/// Build a figment that layers: defaults → config.toml → MSHOCK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MSHOCK_SERVER__PORT=9000`          →  `server.port = 9000`
///   `MSHOCK_TWITCH__OAUTH_TOKEN=...`    →  `twitch.oauth_token = "..."`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("MSHOCK_").split("__"))
}

/// Resolved runtime configuration shared by the hub, feeds, and Helix
/// client. Endpoint URLs are already the debug or real set.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub validate_url: String,
    pub users_url: String,
    pub subscriptions_url: String,
    pub eventsub_ws_url: String,
    pub chat_addr: String,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        if fc.server.host.is_empty() {
            anyhow::bail!("server.host must not be empty");
        }
        let (validate_url, users_url, subscriptions_url, eventsub_ws_url, chat_addr) =
            if fc.twitch.debug {
                (
                    DEBUG_VALIDATE_URL,
                    DEBUG_USERS_URL,
                    DEBUG_SUBSCRIPTIONS_URL,
                    DEBUG_EVENTSUB_WS_URL,
                    DEBUG_CHAT_ADDR,
                )
            } else {
                (
                    VALIDATE_URL,
                    USERS_URL,
                    SUBSCRIPTIONS_URL,
                    EVENTSUB_WS_URL,
                    CHAT_ADDR,
                )
            };
        Ok(Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            client_id: fc.twitch.client_id.clone(),
            validate_url: validate_url.to_string(),
            users_url: users_url.to_string(),
            subscriptions_url: subscriptions_url.to_string(),
            eventsub_ws_url: eventsub_ws_url.to_string(),
            chat_addr: chat_addr.to_string(),
        })
    }
}
