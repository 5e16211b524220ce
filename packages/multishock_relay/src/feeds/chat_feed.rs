//! The line-oriented chat feed.
//!
//! Frame classification is pure (`classify_chunk`); `run_chat_feed` owns
//! the TCP session: login/join handshake, keep-alive pongs, inbound chat
//! lines, and outbound sends with a single reconnect-retry on reset.

use std::io::ErrorKind;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_protocol::Envelope;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Credentials, report_error};
use crate::config::RelayConfig;

/// Bounded wait per socket poll so a stop signal is observed promptly.
const RECV_POLL: Duration = Duration::from_millis(500);

const PONG_LINE: &str = "PONG :tmi.twitch.tv\r\n";

/// What to do with one chunk read from the chat socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    /// Keep-alive ping; answer with a pong on the same socket.
    Pong,
    /// A well-formed chat line.
    Message { username: String, message: String },
    /// Incomplete or unrecognized frame; skipped, not an error.
    Skip,
}

/// Classify a non-empty chunk. A ping marker without a message marker is a
/// keep-alive; a message marker splits on the first two `:` into at most
/// three parts, and fewer than three means the frame is skipped.
pub fn classify_chunk(chunk: &str) -> ChatAction {
    if chunk.contains("PING") && !chunk.contains("PRIVMSG") {
        return ChatAction::Pong;
    }
    if !chunk.contains("PRIVMSG") {
        return ChatAction::Skip;
    }
    let mut parts = chunk.splitn(3, ':');
    let (Some(_), Some(prefix), Some(message)) = (parts.next(), parts.next(), parts.next()) else {
        return ChatAction::Skip;
    };
    let username = prefix.split('!').next().unwrap_or_default().trim();
    ChatAction::Message {
        username: username.to_string(),
        message: message.trim().to_string(),
    }
}

/// The wire protocol is line-delimited; embedded newlines would corrupt
/// framing, so they become spaces.
pub fn sanitize_outbound(message: &str) -> String {
    message.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

/// Maintain the chat session until cancelled or the peer goes away.
/// Restart policy lives with the supervisor.
pub async fn run_chat_feed(
    config: RelayConfig,
    credentials: Credentials,
    events_tx: mpsc::Sender<Envelope>,
    mut outbound_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = match connect_and_join(&config, &credentials).await {
        Ok(stream) => stream.into_split(),
        Err(e) => {
            report_error(&events_tx, format!("twitch chat connect failed: {e:#}")).await;
            return;
        }
    };
    info!(addr = %config.chat_addr, channel = %credentials.username, "joined twitch chat");

    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("chat feed stop requested");
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else { break };
                match send_chat_line(&config, &credentials, &events_tx, writer, &text).await {
                    Some((new_reader, new_writer)) => {
                        if let Some(new_reader) = new_reader {
                            reader = new_reader;
                        }
                        writer = new_writer;
                    }
                    None => break,
                }
            }
            read = tokio::time::timeout(RECV_POLL, reader.read(&mut buf)) => {
                let read = match read {
                    Err(_) => continue, // poll expired, re-check cancellation
                    Ok(read) => read,
                };
                match read {
                    // An empty read means the peer closed the connection.
                    Ok(0) => {
                        report_error(&events_tx, "chat connection closed by server".to_string()).await;
                        break;
                    }
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        match classify_chunk(&chunk) {
                            ChatAction::Pong => {
                                if let Err(e) = writer.write_all(PONG_LINE.as_bytes()).await {
                                    report_error(&events_tx, format!("chat pong failed: {e}")).await;
                                    break;
                                }
                            }
                            ChatAction::Message { username, message } => {
                                let envelope = Envelope::chat_message(&username, &message);
                                if events_tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            ChatAction::Skip => {}
                        }
                    }
                    Err(e) => {
                        report_error(&events_tx, format!("chat read error: {e}")).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Open the socket and perform the login/join handshake.
async fn connect_and_join(config: &RelayConfig, credentials: &Credentials) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(&config.chat_addr)
        .await
        .with_context(|| format!("connecting to chat server {}", config.chat_addr))?;
    let login = format!(
        "PASS oauth:{}\nNICK {}\n",
        credentials.oauth_token, credentials.username
    );
    stream.write_all(login.as_bytes()).await?;
    stream.flush().await?;
    stream
        .write_all(format!("JOIN #{}\n", credentials.username).as_bytes())
        .await?;
    stream.flush().await?;
    Ok(stream)
}

/// Send one outbound chat line. A reset connection gets exactly one
/// reconnect-and-retry of the same message before giving up.
///
/// Returns the (possibly replaced) socket halves, or `None` when the feed
/// should stop.
async fn send_chat_line(
    config: &RelayConfig,
    credentials: &Credentials,
    events_tx: &mpsc::Sender<Envelope>,
    mut writer: OwnedWriteHalf,
    text: &str,
) -> Option<(Option<OwnedReadHalf>, OwnedWriteHalf)> {
    let line = format!(
        "PRIVMSG #{} :{}\n",
        credentials.username,
        sanitize_outbound(text)
    );
    match writer.write_all(line.as_bytes()).await {
        Ok(()) => return Some((None, writer)),
        Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe) => {
            report_error(
                events_tx,
                format!("twitch chat connection lost: {e}, reconnecting"),
            )
            .await;
        }
        Err(e) => {
            report_error(events_tx, format!("unexpected chat write error: {e}")).await;
            return None;
        }
    }

    // One retry on a fresh connection; a second failure is final.
    let (reader, mut writer) = match connect_and_join(config, credentials).await {
        Ok(stream) => stream.into_split(),
        Err(e) => {
            report_error(events_tx, format!("chat reconnect failed: {e:#}")).await;
            return None;
        }
    };
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        report_error(
            events_tx,
            format!("chat send failed after reconnect: {e}"),
        )
        .await;
    }
    Some((Some(reader), writer))
}
