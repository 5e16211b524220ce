use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod config;
mod feeds;
mod hub;
mod twitch;

use crate::config::{FileConfig, RelayConfig};
use crate::feeds::supervisor::{FeedSupervisor, SupervisorHandle};
use crate::feeds::{Credentials, SharedCredentials};
use crate::hub::{Hub, ws_handler};
use crate::twitch::HelixClient;

/// Shared state handed to every downstream connection task.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub supervisor: SupervisorHandle,
    pub credentials: SharedCredentials,
}

#[derive(Parser)]
#[command(name = "multishock")]
#[command(about = "Relay hub between Twitch and local MultiShock consumers")]
struct Cli {
    /// Port for the downstream WebSocket server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Twitch OAuth token (overrides config)
    #[arg(long)]
    oauth_token: Option<String>,

    /// Channel login the token belongs to; resolved from the token when unset
    #[arg(long)]
    username: Option<String>,

    /// Point every Twitch endpoint at a local mock server
    #[arg(short, long)]
    debug: bool,

    /// Directory holding config.toml
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,
}

/// The downstream surface: one WebSocket route, everything else is routing
/// inside the hub.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "multishock=debug,info"
    } else {
        "multishock=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut fc: FileConfig = config::load_config(&cli.config_dir)
        .extract()
        .context("invalid configuration")?;
    if let Some(port) = cli.port {
        fc.server.port = port;
    }
    if cli.oauth_token.is_some() {
        fc.twitch.oauth_token = cli.oauth_token;
    }
    if cli.username.is_some() {
        fc.twitch.username = cli.username;
    }
    if cli.debug {
        fc.twitch.debug = true;
    }
    let config = RelayConfig::from_file(&fc)?;

    let oauth_token = fc.twitch.oauth_token.context(
        "no OAuth token configured; set twitch.oauth_token in config.toml, \
         MSHOCK_TWITCH__OAUTH_TOKEN, or --oauth-token",
    )?;
    let username = match fc.twitch.username {
        Some(username) => username,
        None => {
            let owner = HelixClient::new(&config)
                .resolve_token_owner(&oauth_token)
                .await
                .context("could not resolve the channel the OAuth token belongs to")?;
            info!(login = %owner.login, "resolved channel login from the token");
            owner.login
        }
    };

    let hub = Arc::new(Hub::new());
    let credentials = Credentials {
        oauth_token,
        username,
    };
    let active_credentials = SharedCredentials::default();
    active_credentials.set(credentials.clone()).await;
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let supervisor = FeedSupervisor::new(config.clone(), events_tx).spawn();
    supervisor.start(credentials).await;

    // Feed envelopes fan out to every downstream consumer.
    let pump_hub = hub.clone();
    tokio::spawn(async move {
        while let Some(envelope) = events_rx.recv().await {
            pump_hub.broadcast(&envelope).await;
        }
    });

    let state = AppState {
        hub,
        supervisor: supervisor.clone(),
        credentials: active_credentials,
    };
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("could not bind {}:{}", config.host, config.port))?;
    info!(addr = %listener.local_addr()?, "downstream server listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    supervisor.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}
