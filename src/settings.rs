// src/settings.rs
use clap::Parser;

/// Command-line configuration for the chat server.
#[derive(Parser, Debug, Clone)]
#[command(name = "room-chat", about = "Multi-user TCP room chat server", version)]
pub struct Settings {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// TCP port to listen on.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// How many history entries are replayed on login.
    #[arg(long, default_value_t = 100)]
    pub max_chat_messages: usize,

    /// Seconds a message stays in the history before the sweep drops it.
    #[arg(long, default_value_t = 3600)]
    pub message_ttl: u64,

    /// Ban duration in seconds once a user collects three claims.
    #[arg(long, default_value_t = 120)]
    pub time_of_ban: u64,

    /// Path to the JSON user registry.
    #[arg(long, default_value = "users_database.json")]
    pub user_database_filename: String,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
