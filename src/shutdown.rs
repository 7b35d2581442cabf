use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Install a handler for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal
/// arrives. If the handlers cannot be installed the token is never
/// cancelled.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, stopping immediately");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, stopping immediately");
            }
        }

        token_clone.cancel();
    });

    token
}
