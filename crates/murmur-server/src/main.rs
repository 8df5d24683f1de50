//! # murmur-server
//!
//! Real-time relay hub for end-to-end encrypted chat.
//!
//! This binary provides:
//! - **WebSocket relay** that routes private, group and file-share messages
//!   between registered clients without inspecting their payloads
//! - **Resumable sessions** keyed by client identifier and public key
//! - **Chunked HTTP uploads** with reference-counted file lifetimes
//! - **Periodic maintenance** reaping expired sessions and abandoned uploads

mod api;
mod config;
mod connection;
mod error;
mod files;
mod hub;
mod presence;
mod registry;
mod router;
mod session;
mod shutdown;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::files::FileStore;
use crate::hub::{Hub, HubSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_server=debug")),
        )
        .init();

    info!("Starting murmur relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = FileStore::new(config.upload_dir.clone()).await?;
    let hub = Arc::new(Hub::new(store, HubSettings::from(&config)));

    let app_state = AppState {
        hub: hub.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background maintenance
    // -----------------------------------------------------------------------
    let maintenance = hub.clone();
    let reap_interval = config.reap_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_interval);
        loop {
            interval.tick().await;
            let now = Utc::now();
            let sessions = maintenance.reap_expired_sessions(now).await;
            let uploads = maintenance.sweep_abandoned_uploads(now).await;
            debug!(sessions, uploads, "Maintenance sweep finished");
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP / WebSocket server until a shutdown signal
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let outcome = tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = shutdown::wait_for_signal() => Ok(()),
    };

    shutdown::wipe_upload_dir(hub.store().upload_dir()).await;
    info!("Shutdown complete");

    outcome
}
