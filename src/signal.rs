//! Ctrl-C handling shared by the binaries.

use std::future::Future;
use std::io;
use tracing::{error, info};

/// Resolve on Ctrl-C.
///
/// If the handler cannot be installed the error is logged and this never
/// resolves, so the caller keeps running instead of stopping at once.
pub async fn ctrl_c() {
    wait_for(tokio::signal::ctrl_c()).await
}

async fn wait_for<F>(signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
