//! Job progress reporting.

pub mod progress;

use async_trait::async_trait;
use tracing::info;

pub use progress::ItemProgress;

/// Receives coarse progress messages while a job runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, message: String);
}

/// Writes progress to the log; used by one-shot CLI runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn update(&self, message: String) {
        info!("{}", message);
    }
}
