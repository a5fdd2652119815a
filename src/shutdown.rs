//! Termination-signal handling.

use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::session::AmqpHelper;

/// Resolves once SIGINT (Ctrl+C) or, on unix, SIGTERM arrives.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received SIGINT (Ctrl+C)");
    }

    Ok(())
}

/// Disconnects `helper` from the broker when a termination signal arrives.
pub fn disconnect_on_signal(helper: Arc<AmqpHelper>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("Failed to listen for shutdown signals: {}", e);
            return;
        }
        if let Err(e) = helper.disconnect().await {
            error!("Error while disconnecting: {}", e);
        }
    })
}
