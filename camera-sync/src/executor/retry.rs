//! Retry policies: per-item transfer retries and the device claim loop.

use crate::backends::TransferError;
use crate::config::{CopyConfig, TransferConfig};
use crate::device::{DeviceWaker, SourceDevice};
use crate::utils::errors::{Result, SyncError};
use std::time::Duration;
use tracing::{debug, warn};

/// Retries `Transient` transfer errors a bounded number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt after `attempt` (1-based) failed with
    /// `err`, or `None` to give up.
    pub fn next_delay(&self, attempt: u32, err: &TransferError) -> Option<Duration> {
        (err.is_transient() && attempt < self.max_attempts).then_some(self.delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(5),
        }
    }
}

/// Bounded device claim with increasing backoff. The device is woken before
/// attempts 1, 3, 5, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl ClaimPolicy {
    pub fn from_config(config: &CopyConfig) -> Self {
        Self {
            attempts: config.claim_attempts.max(1),
            backoff: Duration::from_secs(config.claim_backoff_secs),
        }
    }

    pub async fn claim_device(&self, device: &dyn SourceDevice, waker: &dyn DeviceWaker) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            if attempt % 2 == 1 {
                debug!(attempt, "Waking device");
                if let Err(e) = waker.wake().await {
                    warn!(attempt, error = %e, "Wake failed");
                }
            }

            match device.claim().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts = self.attempts, error = %e, "Device claim failed");
                    last_error = Some(e);
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        Err(SyncError::Device(format!(
            "{} not available after {} attempts: {}",
            device.describe(),
            self.attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
