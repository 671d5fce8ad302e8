//! Waking the camera before a claim attempt.
//!
//! The wake itself is delegated to an external command (the controller that
//! powers the camera speaks its own protocol).

use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const WAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait DeviceWaker: Send + Sync {
    async fn wake(&self) -> Result<()>;
}

/// Does nothing; for cameras that are always awake.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWaker;

#[async_trait]
impl DeviceWaker for NoopWaker {
    async fn wake(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs a configured command, e.g. `["/usr/local/bin/wake-camera"]`.
#[derive(Debug, Clone)]
pub struct CommandWaker {
    argv: Vec<String>,
}

impl CommandWaker {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

/// Command waker when one is configured, otherwise a no-op.
pub fn from_argv(argv: &[String]) -> Arc<dyn DeviceWaker> {
    if argv.is_empty() {
        Arc::new(NoopWaker)
    } else {
        Arc::new(CommandWaker::new(argv.to_vec()))
    }
}

#[async_trait]
impl DeviceWaker for CommandWaker {
    async fn wake(&self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| SyncError::Config("copy.wake_command is empty".into()))?;

        debug!(program = %program, "Waking camera");
        let output = tokio::time::timeout(WAKE_TIMEOUT, Command::new(program).args(args).output())
            .await
            .map_err(|_| SyncError::Device(format!("wake command {} timed out", program)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(program = %program, status = %output.status, stderr = %stderr.trim(), "Wake command failed");
            return Err(SyncError::Device(format!(
                "wake command {} exited with {}",
                program, output.status
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_waker() {
        NoopWaker.wake().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_waker_reports_exit_status() {
        CommandWaker::new(vec!["true".into()]).wake().await.unwrap();

        let result = CommandWaker::new(vec!["false".into()]).wake().await;
        assert!(matches!(result, Err(SyncError::Device(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let result = CommandWaker::new(vec!["/nonexistent/wake-camera".into()]).wake().await;
        assert!(matches!(result, Err(SyncError::Io(_))));
    }
}
