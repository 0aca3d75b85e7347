use anyhow::{Context, Result};
use tokio::signal;

/// Resolves on the first Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C");
            }
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        tracing::info!("Received Ctrl+C");
    }

    tracing::info!("Shutting down");
    Ok(())
}
