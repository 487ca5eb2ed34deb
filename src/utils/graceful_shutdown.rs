use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code (tests, embedding applications)
    Requested,
}

/// Coordinates process shutdown: listens for OS signals, fans the event out
/// through a cancellation token, and carries the drain deadline.
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    /// Maximum time to let in-flight requests finish once shutdown starts
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new GracefulShutdown manager with custom timeout
    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            shutdown_timeout,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Token cancelled when shutdown begins; clones can be handed to tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start shutdown. Only the first call has an effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_some() {
                tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
                return;
            }
            *current = Some(reason);
        }
        tracing::info!("Shutdown initiated: {:?}", reason);
        self.token.cancel();
    }

    /// Listen for SIGINT / SIGTERM and trigger shutdown on the first one.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                self.trigger_shutdown(ShutdownReason::Interrupt);
            }
            result = wait_for_sigterm() => {
                result?;
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                self.trigger_shutdown(ShutdownReason::Terminate);
            }
            _ = self.token.cancelled() => {}
        }

        Ok(())
    }

    /// Wait until shutdown has been initiated and return why.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Requested)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> std::io::Result<()> {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
    Ok(())
}
