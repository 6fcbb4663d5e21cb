// src/protocol.rs
//! Wire vocabulary shared by every component: the outbound frame tags, the
//! rendered message lines, the help text and the command grammar clients
//! speak after login.

use chrono::{DateTime, Local};

pub const CHAT_TAG: &str = "Chat!";
pub const PRIVATE_TAG: &str = "Private!";
pub const SERVER_TAG: &str = "Server!";
pub const HISTORY_TAG: &str = "History!";
pub const AUTH_ERROR_TAG: &str = "AuthError!";

/// Help lines sent in response to `@help`, one frame each.
pub const HELP_LINES: [&str; 5] = [
    "help!@<username> <message> -> send private message to user",
    "help!@help -> show this message",
    "help!@claim<username> -> claim a user",
    "help!@comment<message id> <new message> -> comment a message",
    "help!@exit -> exit from the messenger",
];

pub fn chat(text: &str) -> String {
    format!("{}{}", CHAT_TAG, text)
}

pub fn private(text: &str) -> String {
    format!("{}{}", PRIVATE_TAG, text)
}

pub fn server(text: &str) -> String {
    format!("{}{}", SERVER_TAG, text)
}

pub fn history(text: &str) -> String {
    format!("{}{}", HISTORY_TAG, text)
}

pub fn auth_error(text: &str) -> String {
    format!("{}{}", AUTH_ERROR_TAG, text)
}

/// dd.mm.yy HH:MM:SS in server-local time.
pub fn render_stamp(epoch: i64) -> String {
    DateTime::from_timestamp(epoch, 0)
        .map(|t| t.with_timezone(&Local).format("%d.%m.%y %H:%M:%S").to_string())
        .unwrap_or_else(|| "??.??.?? ??:??:??".to_string())
}

/// The canonical room-message line: `[index] (stamp) author: body`.
pub fn render_message(index: u64, epoch: i64, author: &str, body: &str) -> String {
    format!("[{}] ({}) {}: {}", index, render_stamp(epoch), author, body)
}

/// The private-message line: `(stamp) sender: body`. No index, privates
/// never enter the history.
pub fn render_private(epoch: i64, sender: &str, body: &str) -> String {
    format!("({}) {}: {}", render_stamp(epoch), sender, body)
}

/// One classified input line. Everything that does not start with `@` is a
/// broadcast; `@`-lines are commands, and an `@`-line that fits no command
/// shape is `Malformed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Private { to: String, body: String },
    Comment { index: u64, body: String },
    Claim { target: String },
    Help,
    Exit,
    Malformed,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if !line.starts_with('@') {
        return Command::Broadcast(line.to_string());
    }
    if line == "@help" {
        return Command::Help;
    }
    if line == "@exit" {
        return Command::Exit;
    }
    if let Some(rest) = line.strip_prefix("@comment") {
        // Both `@comment3 text` and `@comment 3 text` are accepted.
        return match rest.trim_start().split_once(' ') {
            Some((index, body)) if !body.trim().is_empty() => match index.parse::<u64>() {
                Ok(index) => Command::Comment {
                    index,
                    body: body.trim().to_string(),
                },
                Err(_) => Command::Malformed,
            },
            _ => Command::Malformed,
        };
    }
    if let Some(rest) = line.strip_prefix("@claim") {
        // Both `@claim nick` and `@claimnick` are accepted.
        let target = rest.trim();
        return if target.is_empty() || target.contains(' ') {
            Command::Malformed
        } else {
            Command::Claim {
                target: target.to_string(),
            }
        };
    }
    // Any other @-line is a private message: `@<recipient> <body>`.
    match line[1..].split_once(' ') {
        Some((to, body)) if !to.is_empty() && !body.trim().is_empty() => Command::Private {
            to: to.to_string(),
            body: body.trim().to_string(),
        },
        _ => Command::Malformed,
    }
}
