//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_shared::constants::{
    DEFAULT_HTTP_PORT, MAX_CHUNK_BYTES, OUTBOUND_QUEUE_SIZE, REAP_INTERVAL_SECS,
    SESSION_TIMEOUT_SECS, WRITE_TIMEOUT_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// Directory holding upload sinks and finalized blobs. Wiped on shutdown.
    /// Env: `UPLOAD_DIR`
    /// Default: `./uploads`
    pub upload_dir: PathBuf,

    /// How long a disconnected session can be resumed. Also bounds how long
    /// an unshared upload is kept.
    /// Env: `SESSION_TIMEOUT_SECS`
    pub session_timeout: Duration,

    /// Env: `REAP_INTERVAL_SECS`
    pub reap_interval: Duration,

    /// Per-connection outbound queue capacity, in messages.
    /// Env: `OUTBOUND_QUEUE_SIZE`
    pub outbound_queue: usize,

    /// Env: `WRITE_TIMEOUT_SECS`
    pub write_timeout: Duration,

    /// Maximum body size of one upload request.
    /// Env: `MAX_CHUNK_BYTES`
    pub max_chunk_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            upload_dir: PathBuf::from("./uploads"),
            session_timeout: Duration::from_secs(SESSION_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(REAP_INTERVAL_SECS),
            outbound_queue: OUTBOUND_QUEUE_SIZE,
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECS),
            max_chunk_bytes: MAX_CHUNK_BYTES,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parsed::<SocketAddr>(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("UPLOAD_DIR").filter(|p| !p.is_empty()) {
            config.upload_dir = PathBuf::from(path);
        }

        if let Some(secs) = positive(&lookup, "SESSION_TIMEOUT_SECS") {
            config.session_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = positive(&lookup, "REAP_INTERVAL_SECS") {
            config.reap_interval = Duration::from_secs(secs);
        }

        if let Some(size) = positive(&lookup, "OUTBOUND_QUEUE_SIZE") {
            config.outbound_queue = size as usize;
        }

        if let Some(secs) = positive(&lookup, "WRITE_TIMEOUT_SECS") {
            config.write_timeout = Duration::from_secs(secs);
        }

        if let Some(bytes) = positive(&lookup, "MAX_CHUNK_BYTES") {
            config.max_chunk_bytes = bytes as usize;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid configuration value, using default");
            None
        }
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    match parsed::<u64>(lookup, key)? {
        0 => {
            tracing::warn!(key, "Configuration value must be positive, using default");
            None
        }
        n => Some(n),
    }
}
