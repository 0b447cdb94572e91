//! Termination signal handling
//!
//! The first Ctrl-C or SIGTERM asks the session to stop after the current
//! exposure and park. A second one exits immediately without parking.

use skywatch_sequencer::ShutdownToken;

/// Exit code used when the operator forces an immediate exit
pub const FORCED_EXIT_CODE: i32 = 1;

pub fn spawn_signal_handler(token: ShutdownToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_signal().await {
                tracing::error!("Signal handler failed: {}", e);
                return;
            }
            match token.request() {
                1 => {
                    tracing::warn!("Termination requested, stopping after the current exposure");
                    eprintln!("\nStopping after the current exposure. Press Ctrl-C again to exit immediately.");
                }
                _ => {
                    tracing::warn!("Second termination request, exiting without parking");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
