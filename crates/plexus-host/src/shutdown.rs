//! Graceful shutdown with signal handling

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Shutdown signal shared by the host and whoever may stop it
///
/// Every clone observes a trigger. A triggered signal stays triggered until
/// [`rearm`](Self::rearm), which the host calls when it is started again.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: Arc<Mutex<CancellationToken>>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown
    pub fn trigger(&self) {
        let token = self.token.lock();
        if !token.is_cancelled() {
            tracing::info!("Shutdown signal triggered");
        }
        token.cancel();
    }

    /// Check if shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        self.token.lock().is_cancelled()
    }

    /// Wait until shutdown is triggered
    pub async fn wait(&self) {
        let token = self.token.lock().clone();
        token.cancelled().await;
    }

    /// A token cancelled when shutdown is triggered
    pub fn token(&self) -> CancellationToken {
        self.token.lock().child_token()
    }

    /// Clear a previous trigger
    ///
    /// Tokens handed out before stay cancelled. Returns whether the signal
    /// had been triggered.
    pub fn rearm(&self) -> bool {
        let mut token = self.token.lock();
        if !token.is_cancelled() {
            return false;
        }
        *token = CancellationToken::new();
        tracing::debug!("Shutdown signal rearmed");
        true
    }
}

/// Signal handler for OS signals
#[derive(Debug)]
pub struct SignalHandler {
    signal: ShutdownSignal,
}

impl SignalHandler {
    /// Create a new signal handler
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }

    /// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere) and trigger shutdown
    pub async fn run(self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = sigint.recv() => tracing::info!("Received SIGINT"),
                _ = self.signal.wait() => return Ok(()),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                res = signal::ctrl_c() => {
                    res?;
                    tracing::info!("Received Ctrl+C");
                }
                _ = self.signal.wait() => return Ok(()),
            }
        }

        self.signal.trigger();
        Ok(())
    }
}
