//! Shutdown signals.
//!
//! First signal: cancel the root token, let work drain within the
//! shutdown timeout. Second signal: give up and tear down now.

use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(target_family = "unix")]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(target_family = "unix"))]
async fn terminate() {
    std::future::pending::<()>().await
}

async fn any_signal() {
    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate() => {}
    }
}

/// Watch for shutdown signals and drive the cancellation token.
pub fn spawn(token: CancellationToken) {
    tokio::spawn(async move {
        any_signal().await;
        info!("shutdown requested, draining");
        token.cancel();

        any_signal().await;
        warn!("second signal, tearing down immediately");
        std::process::exit(130);
    });
}
