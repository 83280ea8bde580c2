//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM flip a shared watch flag. The accept loop, the
//! sweeper and the metrics server each hold a [`ShutdownToken`] and
//! finish their in-flight work before exiting.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown controller. Create once in `main`, hand out tokens to tasks.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A token observing this controller.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Request shutdown (also called from tests).
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Spawn a task that triggers shutdown on SIGINT or SIGTERM.
    ///
    /// If the handlers cannot be registered (restricted environments),
    /// the daemon keeps running with signal-driven shutdown disabled.
    pub fn listen_for_signals(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let sigint = signal(SignalKind::interrupt());
            let sigterm = signal(SignalKind::terminate());

            match (sigint, sigterm) {
                (Ok(mut int), Ok(mut term)) => {
                    let received = tokio::select! {
                        _ = int.recv() => "SIGINT",
                        _ = term.recv() => "SIGTERM",
                    };
                    info!(signal = received, "shutdown_signal_received");
                    let _ = tx.send(true);
                }
                (Ok(mut int), Err(e)) => {
                    warn!(error = %e, "sigterm_handler_failed");
                    int.recv().await;
                    info!(signal = "SIGINT", "shutdown_signal_received");
                    let _ = tx.send(true);
                }
                (Err(e), Ok(mut term)) => {
                    warn!(error = %e, "sigint_handler_failed");
                    term.recv().await;
                    info!(signal = "SIGTERM", "shutdown_signal_received");
                    let _ = tx.send(true);
                }
                (Err(e), Err(_)) => {
                    warn!(error = %e, "signal_handlers_unavailable");
                }
            }
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A token that tasks poll or await to observe shutdown.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            // A dropped sender means the controller is gone; treat it as
            // a shutdown rather than waiting forever.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
