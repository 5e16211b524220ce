//! Lifecycle supervision for one Event Feed + Chat Feed pair.
//!
//! Rotation is stop-fully-then-start-fully: a live socket session is bound
//! to the credential that authenticated it, so there is no safe partial
//! update. The old pair is discarded whole and a fresh pair is spawned
//! under the new credentials.
//!
//! A feed that exits on its own (upstream hangup, read error) is restarted
//! under the same credentials after a backoff that doubles per consecutive
//! failure, up to a cap. Exit notices from an already-replaced pair carry a
//! stale generation and are ignored.
//!
//! The supervisor runs on its own task consuming a command channel, so
//! nothing here ever holds a lock the hub needs for routing.

use std::time::Duration;

use relay_protocol::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Credentials, chat_feed, event_feed};
use crate::config::RelayConfig;

/// How long a stopping feed may take to acknowledge before it is
/// abandoned. Its cancel token stays cancelled, so an abandoned task still
/// exits on its next poll.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Restart delay after the first failure; doubles per consecutive failure.
const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Event,
    Chat,
}

#[derive(Debug)]
pub enum SupervisorCommand {
    Start(Credentials),
    Rotate(Credentials),
    SendChat(String),
    Stop,
    /// Internal: a feed task ran to completion on its own.
    FeedExited { generation: u64, kind: FeedKind },
}

/// Cloneable handle for talking to the supervisor task. Delivery failures
/// mean the supervisor is already stopped; they are logged, not escalated.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub async fn start(&self, credentials: Credentials) {
        self.send(SupervisorCommand::Start(credentials)).await;
    }

    pub async fn rotate(&self, credentials: Credentials) {
        self.send(SupervisorCommand::Rotate(credentials)).await;
    }

    pub async fn send_chat(&self, message: String) {
        self.send(SupervisorCommand::SendChat(message)).await;
    }

    pub async fn stop(&self) {
        self.send(SupervisorCommand::Stop).await;
    }

    async fn send(&self, command: SupervisorCommand) {
        if self.tx.send(command).await.is_err() {
            warn!("feed supervisor is stopped, command dropped");
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> (Self, mpsc::Receiver<SupervisorCommand>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

/// One running feed pair and the plumbing to stop or restart it.
struct FeedPair {
    generation: u64,
    credentials: Credentials,
    cancel: CancellationToken,
    event_task: JoinHandle<()>,
    chat_task: JoinHandle<()>,
    chat_tx: mpsc::Sender<String>,
    event_failures: u32,
    chat_failures: u32,
}

enum State {
    Idle,
    Running(FeedPair),
    /// Transient: the old pair is down, the new one not yet up.
    Rotating,
    Stopped,
}

pub struct FeedSupervisor {
    config: RelayConfig,
    events_tx: mpsc::Sender<Envelope>,
    state: State,
    generation: u64,
    /// Exit-notice channel back into the command loop; set by `spawn`.
    notify_tx: Option<mpsc::Sender<SupervisorCommand>>,
}

impl FeedSupervisor {
    pub fn new(config: RelayConfig, events_tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            config,
            events_tx,
            state: State::Idle,
            generation: 0,
            notify_tx: None,
        }
    }

    /// Spawn the supervisor's command loop and return its handle.
    pub fn spawn(mut self) -> SupervisorHandle {
        let (tx, mut rx) = mpsc::channel(32);
        self.notify_tx = Some(tx.clone());
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SupervisorCommand::Start(credentials) => self.start(credentials),
                    SupervisorCommand::Rotate(credentials) => self.rotate(credentials).await,
                    SupervisorCommand::SendChat(message) => self.send_chat(message).await,
                    SupervisorCommand::FeedExited { generation, kind } => {
                        self.feed_exited(generation, kind);
                    }
                    SupervisorCommand::Stop => {
                        self.stop().await;
                        break;
                    }
                }
            }
        });
        SupervisorHandle { tx }
    }

    pub(crate) fn start(&mut self, credentials: Credentials) {
        match self.state {
            State::Idle => {}
            State::Running(_) | State::Rotating => {
                warn!("start while feeds are already running, ignoring");
                return;
            }
            State::Stopped => {
                warn!("start on a stopped supervisor, ignoring");
                return;
            }
        }
        info!(username = %credentials.username, "starting feeds");
        self.state = State::Running(self.spawn_feeds(credentials));
    }

    pub(crate) async fn rotate(&mut self, new_credentials: Credentials) {
        let previous = std::mem::replace(&mut self.state, State::Rotating);
        let pair = match previous {
            State::Running(pair) => pair,
            other => {
                warn!("rotate while feeds are not running, ignoring");
                self.state = other;
                return;
            }
        };
        info!(username = %new_credentials.username, "rotating feed credentials");
        shutdown_pair(pair).await;
        self.state = State::Running(self.spawn_feeds(new_credentials));
        info!("feeds restarted under new credentials");
    }

    /// Idempotent: from any state, both feeds end up stopped.
    pub(crate) async fn stop(&mut self) {
        if let State::Running(pair) = std::mem::replace(&mut self.state, State::Stopped) {
            shutdown_pair(pair).await;
            info!("feeds stopped");
        }
    }

    pub(crate) async fn send_chat(&mut self, message: String) {
        let State::Running(pair) = &self.state else {
            warn!("chat send while feeds are not running, dropping message");
            return;
        };
        if pair.chat_tx.send(message).await.is_err() {
            warn!("chat feed outbound channel closed, message dropped");
        }
    }

    /// A feed task finished on its own. Respawn it under the same
    /// credentials; the replacement sleeps out the backoff before running,
    /// so the command loop never blocks.
    pub(crate) fn feed_exited(&mut self, generation: u64, kind: FeedKind) {
        let (credentials, cancel, delay) = {
            let State::Running(pair) = &mut self.state else {
                return;
            };
            if pair.generation != generation {
                return; // stale notice from a replaced pair
            }
            let failures = match kind {
                FeedKind::Event => {
                    pair.event_failures += 1;
                    pair.event_failures
                }
                FeedKind::Chat => {
                    pair.chat_failures += 1;
                    pair.chat_failures
                }
            };
            (
                pair.credentials.clone(),
                pair.cancel.clone(),
                restart_delay(failures),
            )
        };
        warn!(feed = ?kind, delay_secs = delay.as_secs(), "feed exited, restarting after backoff");
        match kind {
            FeedKind::Event => {
                let task = self.spawn_event_task(credentials, cancel, generation, Some(delay));
                if let State::Running(pair) = &mut self.state {
                    pair.event_task = task;
                }
            }
            FeedKind::Chat => {
                let (chat_tx, chat_rx) = mpsc::channel(32);
                let task =
                    self.spawn_chat_task(credentials, cancel, chat_rx, generation, Some(delay));
                if let State::Running(pair) = &mut self.state {
                    pair.chat_task = task;
                    pair.chat_tx = chat_tx;
                }
            }
        }
    }

    fn spawn_feeds(&mut self, credentials: Credentials) -> FeedPair {
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let (chat_tx, chat_rx) = mpsc::channel(32);
        let event_task =
            self.spawn_event_task(credentials.clone(), cancel.clone(), generation, None);
        let chat_task =
            self.spawn_chat_task(credentials.clone(), cancel.clone(), chat_rx, generation, None);
        FeedPair {
            generation,
            credentials,
            cancel,
            event_task,
            chat_task,
            chat_tx,
            event_failures: 0,
            chat_failures: 0,
        }
    }

    fn spawn_event_task(
        &self,
        credentials: Credentials,
        cancel: CancellationToken,
        generation: u64,
        delay: Option<Duration>,
    ) -> JoinHandle<()> {
        let config = self.config.clone();
        let events_tx = self.events_tx.clone();
        let notify = self.notify_tx.clone();
        tokio::spawn(async move {
            if !wait_out_backoff(delay, &cancel).await {
                return;
            }
            event_feed::run_event_feed(config, credentials, events_tx, cancel.clone()).await;
            notify_exit(notify, generation, FeedKind::Event).await;
        })
    }

    fn spawn_chat_task(
        &self,
        credentials: Credentials,
        cancel: CancellationToken,
        chat_rx: mpsc::Receiver<String>,
        generation: u64,
        delay: Option<Duration>,
    ) -> JoinHandle<()> {
        let config = self.config.clone();
        let events_tx = self.events_tx.clone();
        let notify = self.notify_tx.clone();
        tokio::spawn(async move {
            if !wait_out_backoff(delay, &cancel).await {
                return;
            }
            chat_feed::run_chat_feed(config, credentials, events_tx, chat_rx, cancel.clone()).await;
            notify_exit(notify, generation, FeedKind::Chat).await;
        })
    }
}

/// Backoff for the nth consecutive failure of one feed.
fn restart_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    (RESTART_BACKOFF_BASE * 2u32.pow(exponent)).min(RESTART_BACKOFF_CAP)
}

/// Sleep out a restart backoff. Returns false when cancelled first.
async fn wait_out_backoff(delay: Option<Duration>, cancel: &CancellationToken) -> bool {
    let Some(delay) = delay else { return true };
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn notify_exit(
    notify: Option<mpsc::Sender<SupervisorCommand>>,
    generation: u64,
    kind: FeedKind,
) {
    if let Some(notify) = notify {
        let _ = notify
            .send(SupervisorCommand::FeedExited { generation, kind })
            .await;
    }
}

async fn shutdown_pair(pair: FeedPair) {
    pair.cancel.cancel();
    for (name, task) in [("event", pair.event_task), ("chat", pair.chat_task)] {
        match timeout(STOP_TIMEOUT, task).await {
            Ok(_) => {}
            Err(_) => warn!(feed = name, "feed did not stop in time, abandoning it"),
        }
    }
}
