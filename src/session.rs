// src/session.rs
//! Per-connection lifecycle: authenticate, replay history and queued
//! privates, then serve the read loop until the peer leaves or the server
//! shuts down.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::sink::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::delivery;
use crate::protocol::{self, Command};
use crate::registry::{self, UserRecord, UserRegistry};
use crate::settings::Settings;
use crate::state::{epoch_now, SharedState};
use crate::transport::{AuthLineCodec, LineChunkCodec};

type AuthReader = FramedRead<OwnedReadHalf, AuthLineCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LineChunkCodec>;

pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<Settings>,
    registry: Arc<UserRegistry>,
    state: SharedState,
    shutdown: CancellationToken,
) {
    debug!(%peer, "serving connection");

    // The first exchange is strictly line-delimited; only after login does
    // the read side switch to the loose per-payload framing. The swap keeps
    // any bytes the client already sent ahead.
    let (read_half, write_half) = stream.into_split();
    let mut auth_reader = FramedRead::new(read_half, AuthLineCodec);
    let mut writer = FramedWrite::new(write_half, LineChunkCodec);

    let nick =
        match authenticate(&mut auth_reader, &mut writer, &registry, &state, &shutdown).await {
            Some(nick) => nick,
            None => {
                debug!(%peer, "connection closed before login");
                return;
            }
        };
    let mut reader = auth_reader.map_decoder(|_| LineChunkCodec);

    // The write half moves into its own task; the roster only ever holds the
    // channel end, so no two tasks write the same socket.
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    spawn_writer(writer, rx, tx.downgrade(), nick.clone(), state.clone());

    if !delivery::replay_on_login(&state, &nick, &tx, settings.max_chat_messages) {
        let _ = tx.send(protocol::auth_error("User already connected!"));
        return;
    }
    info!(%peer, nick = %nick, "user joined the chat");

    let session = Session {
        nick: nick.clone(),
        tx: tx.clone(),
        settings,
        registry,
        state: state.clone(),
    };
    while let Some(frame) = next_frame(&mut reader, &shutdown).await {
        if !session.dispatch(protocol::parse_command(&frame)) {
            break;
        }
    }

    state.lock().unwrap().roster_remove_entry(&nick, &tx);
    info!(%peer, nick = %nick, "user left the chat");
}

struct Session {
    nick: String,
    tx: mpsc::UnboundedSender<String>,
    settings: Arc<Settings>,
    registry: Arc<UserRegistry>,
    state: SharedState,
}

impl Session {
    /// Executes one classified frame. Returns false when the session should
    /// close.
    fn dispatch(&self, command: Command) -> bool {
        match command {
            Command::Exit => return false,
            Command::Help => {
                for line in protocol::HELP_LINES {
                    let _ = self.tx.send(line.to_string());
                }
            }
            Command::Broadcast(body) => {
                // Bans mute broadcasts only; sending does not consume them.
                let minutes = self
                    .state
                    .lock()
                    .unwrap()
                    .ban_minutes_left(&self.nick, epoch_now());
                match minutes {
                    Some(minutes) => {
                        let _ = self.tx.send(protocol::server(&format!(
                            "You are not allowed to send messages ({} minutes left)",
                            minutes
                        )));
                    }
                    None => delivery::broadcast(&self.state, &self.nick, &body),
                }
            }
            Command::Private { to, body } => {
                delivery::private(&self.state, &self.registry, &self.nick, &to, &body, &self.tx);
            }
            Command::Comment { index, body } => {
                delivery::comment(&self.state, &self.nick, index, &body, &self.tx);
            }
            Command::Claim { target } => {
                delivery::claim(
                    &self.state,
                    &self.registry,
                    self.settings.time_of_ban,
                    &self.nick,
                    &target,
                    &self.tx,
                );
            }
            Command::Malformed => {
                let _ = self
                    .tx
                    .send(protocol::server("Don't use @ symbol if its not a command!"));
            }
        }
        true
    }
}

/// AUTH step: the first non-empty frame is `<nick> <password>` to log in or
/// `new <nick> <password>` to register. Every failure answers with one
/// `AuthError!` frame and `None`, which closes the connection.
async fn authenticate(
    reader: &mut AuthReader,
    writer: &mut Writer,
    registry: &UserRegistry,
    state: &SharedState,
    shutdown: &CancellationToken,
) -> Option<String> {
    let line = next_frame(reader, shutdown).await?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["new", nick, password] => register(writer, registry, nick, password).await,
        [nick, password] => login(writer, registry, state, nick, password).await,
        _ => {
            send(writer, protocol::auth_error("Wrong command format! Try later!")).await;
            None
        }
    }
}

async fn login(
    writer: &mut Writer,
    registry: &UserRegistry,
    state: &SharedState,
    nick: &str,
    password: &str,
) -> Option<String> {
    let records = match registry.load() {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "user database unavailable");
            send(writer, protocol::auth_error("User database unavailable!")).await;
            return None;
        }
    };
    let record = match records.iter().find(|r| r.username == nick) {
        Some(record) => record,
        None => {
            send(
                writer,
                protocol::auth_error("User not found! Register first!"),
            )
            .await;
            return None;
        }
    };
    if record.password != password {
        send(writer, protocol::auth_error("Wrong password! Try again!")).await;
        return None;
    }
    if state.lock().unwrap().is_online(nick) {
        send(writer, protocol::auth_error("User already connected!")).await;
        return None;
    }
    if let Err(e) = registry.update_last_visit(nick, registry::visit_stamp()) {
        error!(error = %e, "user database unavailable");
        send(writer, protocol::auth_error("User database unavailable!")).await;
        return None;
    }
    Some(nick.to_string())
}

async fn register(
    writer: &mut Writer,
    registry: &UserRegistry,
    nick: &str,
    password: &str,
) -> Option<String> {
    match registry.find(nick) {
        Ok(Some(_)) => {
            send(writer, protocol::auth_error("User already exists!")).await;
            None
        }
        Ok(None) => {
            let record = UserRecord {
                username: nick.to_string(),
                password: password.to_string(),
                last_visit: registry::visit_stamp(),
            };
            match registry.append(record) {
                Ok(()) => Some(nick.to_string()),
                Err(e) => {
                    error!(error = %e, "user database unavailable");
                    send(writer, protocol::auth_error("User database unavailable!")).await;
                    None
                }
            }
        }
        Err(e) => {
            error!(error = %e, "user database unavailable");
            send(writer, protocol::auth_error("User database unavailable!")).await;
            None
        }
    }
}

/// Reads the next non-empty frame. `None` on EOF, read error or shutdown.
async fn next_frame<D>(
    reader: &mut FramedRead<OwnedReadHalf, D>,
    shutdown: &CancellationToken,
) -> Option<String>
where
    D: Decoder<Item = String, Error = std::io::Error>,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return None,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(line)) if line.is_empty() => continue,
            Some(Ok(line)) => return Some(line),
            Some(Err(e)) => {
                debug!(error = %e, "read error");
                return None;
            }
            None => return None,
        }
    }
}

async fn send(writer: &mut Writer, line: String) {
    if let Err(e) = writer.send(line).await {
        debug!(error = %e, "failed to write to client");
    }
}

fn spawn_writer(
    mut writer: Writer,
    mut rx: mpsc::UnboundedReceiver<String>,
    own: mpsc::WeakUnboundedSender<String>,
    nick: String,
    state: SharedState,
) {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.send(line).await {
                debug!(nick = %nick, error = %e, "write failed, dropping connection");
                break;
            }
        }
        // A failed write counts as a disconnect for this peer: drop its
        // roster entry so the nickname frees up. When the channel drained
        // normally the entry (which holds a sender) is already gone and the
        // upgrade fails.
        if let Some(tx) = own.upgrade() {
            state.lock().unwrap().roster_remove_entry(&nick, &tx);
        }
    });
}
