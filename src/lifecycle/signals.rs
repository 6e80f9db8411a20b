//! OS signal handling.
//!
//! # Responsibilities
//! - Translate SIGINT / SIGTERM into the graceful shutdown sequence
//! - Let a second signal cut a drain short
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - No SIGHUP handling; configuration does not reload

/// Resolves when the process receives SIGINT or SIGTERM.
///
/// Each call installs fresh handlers, so calling it again while a drain
/// is in progress catches the operator's second, patience-exhausted
/// signal.
pub async fn terminated() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt =
            signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}
