//! Graceful shutdown for the release controller
//!
//! On SIGTERM or SIGINT the controller marks itself not ready and stops the
//! Release controller, which lets in-flight ticks finish before exit. Queued
//! ticks are picked up again by the next controller's initial list.

use tokio::sync::watch;
use tracing::info;

/// Receiving half of the shutdown broadcast
///
/// Cheap to clone; every clone observes the same trigger.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered or the controller is dropped
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    /// Non-blocking check used before spawning new work
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending half of the shutdown broadcast
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        // Ignore send errors: no receivers left means nothing to stop
        let _ = self.sender.send(true);
        info!("Shutdown signal sent");
    }
}

/// Create a linked `(controller, signal)` pair
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT and return its name
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<&'static str, std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

/// Wait for Ctrl+C (non-unix)
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<&'static str, std::io::Error> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "CTRL_C", "Received termination signal");
    Ok("CTRL_C")
}
