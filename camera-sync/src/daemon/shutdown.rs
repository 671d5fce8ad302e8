//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Ensures that:
//! - Running jobs stop after the item they are transferring
//! - Items already recorded stay recorded
//! - The process does not hang on a stuck backend

use crate::api::job_tracker::JobTracker;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long shutdown waits for active jobs.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
        }
    }

    /// Token that fires once shutdown starts; hand it to the job tracker.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {}
        }
    }

    /// Cancel running jobs and wait for them to settle, up to the grace period.
    pub async fn shutdown(&self, tracker: &JobTracker) {
        info!("Graceful shutdown initiated");
        self.token.cancel();

        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            let active = tracker.active_count().await;
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "Jobs still running after grace period");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
