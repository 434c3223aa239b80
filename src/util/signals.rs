//! Process-wide stop flag for the synchronous roles.
//!
//! The handler only flips an atomic; the tracer and watcher poll it at their
//! suspension points and unwind cleanly instead of dying mid-write.

use std::sync::atomic::{AtomicBool, Ordering};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route SIGINT, SIGTERM and SIGHUP to the returned flag.
///
/// A process gets one handler; later calls keep the first and only log.
pub fn install_stop_handler() -> &'static AtomicBool {
    if let Err(e) = ctrlc::set_handler(|| STOP_REQUESTED.store(true, Ordering::SeqCst)) {
        tracing::warn!(error = %e, "Cannot install signal handler");
    }
    &STOP_REQUESTED
}

/// Resolves once the server should stop: Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
