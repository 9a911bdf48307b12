use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
/// If the Unix handlers cannot be installed, Ctrl-C is the only trigger.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => {
                tracing::info!(signal = name, "Received signal, initiating graceful shutdown");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl-C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
                tracing::info!("Received Ctrl-C, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}
