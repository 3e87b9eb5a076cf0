use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT
    Graceful,
    /// Drain deadline exceeded
    Force,
}

/// Fans a single shutdown decision out to every background task through a
/// [`CancellationToken`].
pub struct GracefulShutdown {
    token: CancellationToken,
    shutdown_initiated: Arc<AtomicBool>,
    /// Maximum time in-flight requests get to finish
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    /// Token cancelled once shutdown starts. Child tokens are handed to tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "Shutdown initiated");
            self.token.cancel();
        } else {
            tracing::warn!("Shutdown already initiated, ignoring signal");
        }
    }

    /// Waits for SIGINT or SIGTERM and starts the shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        #[cfg(unix)]
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to register SIGTERM handler")?;

        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                return Ok(());
            }
        }

        self.trigger_shutdown(ShutdownReason::Graceful);
        Ok(())
    }

    /// Resolves once shutdown has been initiated.
    pub async fn wait_for_shutdown_signal(&self) {
        self.token.cancelled().await;
    }

    /// Waits for `drain` to finish, up to the drain timeout.
    pub async fn drain<F: std::future::Future>(&self, drain: F) -> ShutdownReason {
        match tokio::time::timeout(self.drain_timeout, drain).await {
            Ok(_) => ShutdownReason::Graceful,
            Err(_) => {
                tracing::error!(
                    "Shutdown timeout exceeded ({:?}), forcing shutdown",
                    self.drain_timeout
                );
                ShutdownReason::Force
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert!(!shutdown.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_trigger_cancels_children() {
        let shutdown = GracefulShutdown::new();
        let child = shutdown.token().child_token();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert!(shutdown.is_shutdown_initiated());
        assert!(child.is_cancelled());
        shutdown.wait_for_shutdown_signal().await;
    }

    #[tokio::test]
    async fn test_signal_handler_returns_after_manual_trigger() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let handler = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.run_signal_handler().await })
        };
        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(1));
        assert_eq!(
            shutdown.drain(std::future::pending::<()>()).await,
            ShutdownReason::Force
        );
        assert_eq!(shutdown.drain(async {}).await, ShutdownReason::Graceful);
    }
}
