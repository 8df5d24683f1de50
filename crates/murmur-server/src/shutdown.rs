//! Process shutdown: wait for a termination signal, then wipe uploads.

use std::io::ErrorKind;
use std::path::Path;

use tracing::{info, warn};

/// Resolve on Ctrl+C, or SIGTERM on unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Delete the whole upload directory. Errors are logged, not retried.
pub async fn wipe_upload_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => info!(path = %dir.display(), "Removed upload directory"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove upload directory"),
    }
}
