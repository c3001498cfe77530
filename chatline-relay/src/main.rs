//! Chatline relay server: direct messaging over WebSocket.
//!
//! Clients connect to `/ws`, authenticate, and exchange one-to-one messages.
//! History and presence live in the configured store.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9501
//! cargo run --bin chatline-relay
//!
//! # Run on custom address
//! cargo run --bin chatline-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! CHATLINE_ADDR=127.0.0.1:8080 cargo run --bin chatline-relay
//! ```

use std::sync::Arc;

use chatline_relay::config::{RelayCliArgs, RelayConfig};
use chatline_relay::relay::{self, RelayState};
use chatline_relay::store::{MemoryStore, RetryingStore};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting chatline relay server");

    let store = Arc::new(RetryingStore::new(MemoryStore::new(), config.retry_attempts));
    let state = Arc::new(RelayState::with_settings(store, config.settings()));

    match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::error!(error = %e, "failed to listen for shutdown signal");
                    }
                    tracing::info!(
                        connections = state.registry.connection_count().await,
                        "shutting down, closing connections"
                    );
                    state.registry.close_all().await;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
