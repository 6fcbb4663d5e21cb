// src/delivery.rs
//! Fan-out paths between sessions: broadcasts, comments, privates, claims
//! and the login replay. Frames are pushed into per-connection writer
//! channels while the state lock is held, which keeps per-recipient order
//! aligned with history order; the actual socket writes happen in each
//! connection's writer task, never under the lock.

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::protocol;
use crate::registry::UserRegistry;
use crate::state::{epoch_now, SharedState};

/// Appends to history and delivers `Chat!` to the whole roster, the author
/// included.
pub fn broadcast(state: &SharedState, author: &str, body: &str) {
    let mut state = state.lock().unwrap();
    let message = state.append_broadcast(author, body, epoch_now());
    let line = protocol::chat(&message.text);
    for sender in state.roster_senders() {
        let _ = sender.send(line.clone());
    }
    debug!(index = message.index, author, "broadcast delivered");
}

/// Comments are broadcast like any room message; a missing original answers
/// the commenter alone.
pub fn comment(
    state: &SharedState,
    author: &str,
    original: u64,
    body: &str,
    reply: &UnboundedSender<String>,
) {
    let mut state = state.lock().unwrap();
    match state.append_comment(author, original, body, epoch_now()) {
        Some(message) => {
            let line = protocol::chat(&message.text);
            for sender in state.roster_senders() {
                let _ = sender.send(line.clone());
            }
            debug!(index = message.index, author, original, "comment delivered");
        }
        None => {
            let _ = reply.send(protocol::server("Message not found or deleted!"));
        }
    }
}

/// Unicast to an online recipient, queue for a registered offline one,
/// reject an unknown one. The registry file is read before the lock is
/// taken and only disambiguates "offline but known" from "unknown"; the
/// roster check and the enqueue share one lock hold, so a recipient logging
/// in concurrently either gets the message directly or finds it in the
/// queue their login replay drains.
pub fn private(
    state: &SharedState,
    registry: &UserRegistry,
    sender_nick: &str,
    recipient: &str,
    body: &str,
    reply: &UnboundedSender<String>,
) {
    let known = match registry.find(recipient) {
        Ok(found) => found.is_some(),
        Err(e) => {
            error!(error = %e, "user database lookup failed during private delivery");
            let _ = reply.send(protocol::server("Private message could not be delivered!"));
            return;
        }
    };
    let rendered = protocol::render_private(epoch_now(), sender_nick, body);

    let mut state = state.lock().unwrap();
    if let Some(target) = state.roster_lookup(recipient) {
        let _ = target.send(protocol::private(&rendered));
        let _ = reply.send(protocol::server(&format!(
            "Private message was sent to {}",
            recipient
        )));
    } else if known {
        state.enqueue_private(recipient, rendered);
        let _ = reply.send(protocol::server(&format!(
            "User {} is not connected",
            recipient
        )));
    } else {
        let _ = reply.send(protocol::server(&format!(
            "User {} is not registered",
            recipient
        )));
    }
}

/// Claims only count against online targets; three claims insert the ban in
/// the same locked section that resets the counter. The registry is read
/// before the lock for the same reason as in `private`.
pub fn claim(
    state: &SharedState,
    registry: &UserRegistry,
    time_of_ban: u64,
    claimer: &str,
    target: &str,
    reply: &UnboundedSender<String>,
) {
    let known = match registry.find(target) {
        Ok(found) => found.is_some(),
        Err(e) => {
            error!(error = %e, "user database lookup failed during claim");
            let _ = reply.send(protocol::server("Claim could not be processed!"));
            return;
        }
    };

    let mut state = state.lock().unwrap();
    if state.is_online(target) {
        let banned = state.add_claim(target, epoch_now(), time_of_ban);
        let _ = reply.send(protocol::server(&format!(
            "Claim on user {} accepted",
            target
        )));
        if banned {
            debug!(banned_user = target, claimer, "user banned after three claims");
        }
    } else if known {
        let _ = reply.send(protocol::server(&format!(
            "User {} is not connected",
            target
        )));
    } else {
        let _ = reply.send(protocol::server(&format!(
            "User {} is not registered",
            target
        )));
    }
}

/// Login replay. One lock acquisition covers the history snapshot, the
/// pending-private drain and the roster registration, so no broadcast can
/// interleave ahead of the replay and no concurrent enqueue is lost.
/// Returns false when the nickname is already online.
pub fn replay_on_login(
    state: &SharedState,
    nick: &str,
    sender: &UnboundedSender<String>,
    limit: usize,
) -> bool {
    let mut state = state.lock().unwrap();
    if !state.roster_add(nick, sender.clone()) {
        return false;
    }
    for text in state.recent_history(limit) {
        let _ = sender.send(protocol::history(&text));
    }
    for body in state.drain_private(nick) {
        let _ = sender.send(protocol::private(&body));
    }
    true
}
