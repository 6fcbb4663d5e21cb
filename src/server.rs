// src/server.rs
//! TCP listener, session supervision and the two periodic maintenance
//! loops (history TTL sweep, ban-expiry sweep).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::UserRegistry;
use crate::session;
use crate::settings::Settings;
use crate::state::{epoch_now, ChatState, SharedState};

/// Seconds between history TTL sweeps.
const HISTORY_SWEEP_SECS: u64 = 10;
/// Seconds between ban-expiry sweeps.
const BAN_SWEEP_SECS: u64 = 30;

pub struct ChatServer {
    settings: Arc<Settings>,
    registry: Arc<UserRegistry>,
    state: SharedState,
}

impl ChatServer {
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(UserRegistry::new(&settings.user_database_filename));
        Self {
            settings: Arc::new(settings),
            registry,
            state: ChatState::shared(),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let address = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("could not bind {}", address))?;
        info!(%address, "chat server listening");
        self.run_on(listener, shutdown).await
    }

    /// Serves on an already-bound listener. Used directly by tests, which
    /// bind port 0 and read the address back.
    pub async fn run_on(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut sweeps = JoinSet::new();
        sweeps.spawn(sweep_history(
            self.state.clone(),
            self.settings.message_ttl,
            shutdown.clone(),
        ));
        sweeps.spawn(sweep_bans(self.state.clone(), shutdown.clone()));

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(session::run_session(
                            stream,
                            peer,
                            self.settings.clone(),
                            self.registry.clone(),
                            self.state.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    // A panicking session must not take the listener down.
                    if let Err(e) = finished {
                        warn!(error = %e, "session task failed");
                    }
                }
            }
        }

        info!("shutting down, waiting for sessions to close");
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "session task failed during shutdown");
            }
        }
        sweeps.shutdown().await;
        Ok(())
    }
}

async fn sweep_history(state: SharedState, ttl: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(HISTORY_SWEEP_SECS));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let removed = state.lock().unwrap().sweep_expired_history(epoch_now(), ttl);
        if removed > 0 {
            debug!(removed, "expired messages removed from history");
        }
    }
}

async fn sweep_bans(state: SharedState, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(BAN_SWEEP_SECS));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let removed = state.lock().unwrap().sweep_expired_bans(epoch_now());
        if removed > 0 {
            debug!(removed, "expired bans removed");
        }
    }
}
