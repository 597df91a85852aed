//! Signal-to-cancellation translation.
//!
//! OS signal handling is kept to a single job: turn SIGINT/SIGTERM into
//! a call on an explicit cancellation token. No process-wide mutable
//! state — the token is passed into the runner and the controller, and
//! everything downstream observes it cooperatively.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawn a task that cancels `cancel` on the first shutdown signal
/// (Ctrl-C everywhere, SIGTERM additionally on unix).
///
/// The engine subprocess is then stopped gracefully by the controller;
/// the interrupted segment keeps its `running` status on disk and the
/// resume resolver reclassifies it on the next startup.
pub fn cancel_on_shutdown(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
        }
        info!("Shutdown signal received, requesting stop");
        cancel.cancel();
    })
}
