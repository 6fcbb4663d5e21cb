// src/state.rs
//! All mutable room state behind one mutex: the history ring with its
//! monotonic index, the online roster, pending offline privates, claim
//! counters and the ban table. Operations take an explicit `now` where the
//! clock matters so the sweeps and ban arithmetic stay testable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::protocol;

pub type SharedState = Arc<Mutex<ChatState>>;

/// Claims needed before a target is banned.
const CLAIMS_FOR_BAN: u32 = 3;

/// A message frozen at acceptance time. `text` is the fully rendered line
/// (for comments: the quoted composite), sent verbatim on broadcast and on
/// history replay.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub index: u64,
    pub timestamp: i64,
    pub text: String,
}

pub fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct ChatState {
    next_index: u64,
    history: VecDeque<StoredMessage>,
    roster: HashMap<String, UnboundedSender<String>>,
    pending_private: HashMap<String, Vec<String>>,
    claims: HashMap<String, u32>,
    bans: HashMap<String, i64>,
}

impl ChatState {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            history: VecDeque::new(),
            roster: HashMap::new(),
            pending_private: HashMap::new(),
            claims: HashMap::new(),
            bans: HashMap::new(),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Assigns the next index, renders and stores the message.
    pub fn append_broadcast(&mut self, author: &str, body: &str, now: i64) -> StoredMessage {
        let text = protocol::render_message(self.next_index, now, author, body);
        self.push_message(text, now)
    }

    /// Quotes the message with index `original` and stores the composite
    /// under a fresh index. `None` when the original is gone from history,
    /// which includes indices the TTL sweep already removed.
    pub fn append_comment(
        &mut self,
        author: &str,
        original: u64,
        body: &str,
        now: i64,
    ) -> Option<StoredMessage> {
        let quoted = self
            .history
            .iter()
            .find(|m| m.index == original)?
            .text
            .clone();
        let line = protocol::render_message(self.next_index, now, author, body);
        Some(self.push_message(format!("Commenting {}\n{}", quoted, line), now))
    }

    fn push_message(&mut self, text: String, now: i64) -> StoredMessage {
        let message = StoredMessage {
            index: self.next_index,
            timestamp: now,
            text,
        };
        self.next_index += 1;
        self.history.push_back(message.clone());
        message
    }

    /// False when the nickname is already online.
    pub fn roster_add(&mut self, nick: &str, sender: UnboundedSender<String>) -> bool {
        if self.roster.contains_key(nick) {
            return false;
        }
        self.roster.insert(nick.to_string(), sender);
        true
    }

    /// Removes the roster entry only if it still belongs to `sender`, so a
    /// late writer-task cleanup cannot evict a newer session that reclaimed
    /// the nickname.
    pub fn roster_remove_entry(&mut self, nick: &str, sender: &UnboundedSender<String>) {
        if let Some(current) = self.roster.get(nick) {
            if current.same_channel(sender) {
                self.roster.remove(nick);
            }
        }
    }

    pub fn is_online(&self, nick: &str) -> bool {
        self.roster.contains_key(nick)
    }

    pub fn roster_lookup(&self, nick: &str) -> Option<UnboundedSender<String>> {
        self.roster.get(nick).cloned()
    }

    pub fn roster_senders(&self) -> Vec<UnboundedSender<String>> {
        self.roster.values().cloned().collect()
    }

    pub fn enqueue_private(&mut self, recipient: &str, rendered: String) {
        self.pending_private
            .entry(recipient.to_string())
            .or_default()
            .push(rendered);
    }

    /// Removes and returns the queue, oldest first. A second drain yields
    /// nothing.
    pub fn drain_private(&mut self, recipient: &str) -> Vec<String> {
        self.pending_private.remove(recipient).unwrap_or_default()
    }

    /// Counts one claim against `target`. The third claim resets the counter
    /// and inserts the ban in the same step; returns true exactly then.
    pub fn add_claim(&mut self, target: &str, now: i64, ban_secs: u64) -> bool {
        let count = self.claims.entry(target.to_string()).or_insert(0);
        *count += 1;
        if *count < CLAIMS_FOR_BAN {
            return false;
        }
        self.claims.remove(target);
        self.bans.insert(target.to_string(), now + ban_secs as i64);
        true
    }

    /// Minutes remaining on an active ban, rounded up. `None` once the
    /// expiry passed, even if the sweep has not removed the entry yet.
    pub fn ban_minutes_left(&self, nick: &str, now: i64) -> Option<u64> {
        let left = self.bans.get(nick)? - now;
        if left <= 0 {
            None
        } else {
            Some((left as u64).div_ceil(60))
        }
    }

    /// The last `limit` history texts, oldest first.
    pub fn recent_history(&self, limit: usize) -> Vec<String> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).map(|m| m.text.clone()).collect()
    }

    /// Drops messages older than `ttl` from the front. History is
    /// append-ordered by time, so the scan stops at the first still-valid
    /// entry.
    pub fn sweep_expired_history(&mut self, now: i64, ttl: u64) -> usize {
        let mut removed = 0;
        while let Some(front) = self.history.front() {
            if now - front.timestamp <= ttl as i64 {
                break;
            }
            self.history.pop_front();
            removed += 1;
        }
        removed
    }

    /// Drops ban entries whose expiry is at or before `now`.
    pub fn sweep_expired_bans(&mut self, now: i64) -> usize {
        let before = self.bans.len();
        self.bans.retain(|_, expiry| *expiry > now);
        before - self.bans.len()
    }
}
