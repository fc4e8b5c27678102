//! Graceful shutdown utilities
//!
//! Provides unified shutdown signal handling for the bridge service.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
///
/// This function blocks until a shutdown signal is received:
/// - On Unix: Ctrl+C (SIGINT) or SIGTERM
/// - On Windows: Ctrl+C only
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Cancel `token` once a shutdown signal arrives.
///
/// Returns early without cancelling if the token is cancelled elsewhere first.
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received");
            token.cancel();
        },
        _ = token.cancelled() => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_on_signal_returns_when_token_cancelled() {
        let token = CancellationToken::new();
        let waiter = tokio::spawn(cancel_on_signal(token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .expect("waiter should not panic");
    }
}
