//! Graceful shutdown on SIGTERM/SIGINT
//!
//! `main` waits for a signal, flips readiness off, then broadcasts shutdown
//! over a watch channel so background tasks (reflectors, the health server)
//! stop together.

use tokio::sync::watch;
use tracing::info;

/// Receiving side, cloned into every task that must stop
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is triggered or the controller is dropped
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending side, owned by `main`
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
        info!("Shutdown signal sent");
    }
}

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

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<&'static str, std::io::Error> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok("CTRL_C")
}
