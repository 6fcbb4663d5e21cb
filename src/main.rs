// src/main.rs
use clap::Parser;
use room_chat::server::ChatServer;
use room_chat::settings::Settings;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    room_chat::init_tracing(settings.verbose);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            signal_token.cancel();
        }
    });

    ChatServer::new(settings).run(shutdown).await
}
