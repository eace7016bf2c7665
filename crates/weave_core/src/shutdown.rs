//! Process shutdown signals.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

/// Resolves once the process is asked to stop: SIGINT or SIGTERM on Unix,
/// Ctrl+C elsewhere.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// A broadcast channel whose sender fires once [`shutdown_signal`] resolves.
///
/// Background tasks take a receiver from the returned sender via
/// `subscribe()`; callers may also send on it to stop early.
pub fn shutdown_channel() -> broadcast::Sender<()> {
    let (tx, _) = broadcast::channel(1);
    let notify = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::warn!("Signal handler failed: {e}");
            return;
        }
        let _ = notify.send(());
    });
    tx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
