// src/lib.rs
pub mod delivery;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod settings;
pub mod state;
pub mod transport;

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// verbosity flag.
pub fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
