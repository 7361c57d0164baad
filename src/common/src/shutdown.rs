use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

/// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

/// Returns a token that is cancelled once a shutdown signal arrives.
///
/// If the signal handlers cannot be installed the token is cancelled
/// immediately so nothing runs unsupervised.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "Shutdown handler failed");
        }
        trigger.cancel();
    });

    token
}
