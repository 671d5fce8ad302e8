//! Hourly scheduler for the copy and transfer windows.
//!
//! The scheduler fires at the top of every hour, reloads the configuration
//! and submits whichever stage is due. A stage that is still running from an
//! earlier window is skipped, not queued.

use crate::api::job_tracker::JobTracker;
use crate::api::jobs::{start_camera_copy, start_cloud_transfer};
use crate::config::Config;
use crate::executor::JobKind;
use crate::utils::errors::SyncError;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Top of every hour (sec min hour day month weekday)
pub const HOURLY: &str = "0 0 * * * *";

pub struct SyncScheduler {
    scheduler: Mutex<JobScheduler>,
    tracker: JobTracker,
    config_path: Option<PathBuf>,
}

impl SyncScheduler {
    pub async fn new(tracker: JobTracker, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            tracker,
            config_path,
        })
    }

    /// Register the hourly check.
    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let tracker = self.tracker.clone();
        let config_path = self.config_path.clone();

        let job = Job::new_async(HOURLY, move |_uuid, _lock| {
            let tracker = tracker.clone();
            let config_path = config_path.clone();
            Box::pin(async move {
                let config = match Config::load(config_path.as_deref()) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::error!(error = %e, "Skipping scheduled check: configuration invalid");
                        return;
                    }
                };
                run_due_jobs(&tracker, &config, Local::now()).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %HOURLY, "Schedule check registered");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Submit every stage whose window contains `now`; returns what was started.
pub async fn run_due_jobs(tracker: &JobTracker, config: &Config, now: DateTime<Local>) -> Vec<JobKind> {
    let mut started = Vec::new();

    if config.copy.is_due(&now) {
        let result = start_camera_copy(tracker, config.clone()).await;
        record_submission(JobKind::CameraCopy, result, &mut started);
    }

    if config.transfer.is_due(&now) {
        let result = start_cloud_transfer(tracker, config.clone()).await;
        record_submission(JobKind::CloudTransfer, result, &mut started);
    }

    if started.is_empty() {
        tracing::debug!(hour = %now.format("%H:00"), "Nothing scheduled this hour");
    }
    started
}

fn record_submission(kind: JobKind, result: crate::Result<String>, started: &mut Vec<JobKind>) {
    match result {
        Ok(job_id) => {
            tracing::info!(job_id = %job_id, kind = %kind, "Starting scheduled job");
            started.push(kind);
        }
        Err(SyncError::AlreadyRunning(_)) => {
            tracing::warn!(kind = %kind, "Skipping scheduled run: job already running");
        }
        Err(e) => {
            tracing::error!(kind = %kind, error = %e, "Scheduled job failed to start");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleDay, TransferMethod};
    use crate::executor::{JobOutcome, JobSummary};
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.photos_dir = dir.path().join("photos");
        config.paths.thumbs_dir = dir.path().join("thumbs");
        config.copy.device_root = dir.path().join("camera");
        config.copy.claim_attempts = 1;
        config.copy.claim_backoff_secs = 0;
        config
    }

    fn at(hour: u32) -> DateTime<Local> {
        // 2024-05-01 was a Wednesday
        Local.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_only_due_stages_start() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.copy.day = ScheduleDay::Daily;
        config.copy.hour = 6;
        config.transfer.method = TransferMethod::Ftp;
        config.transfer.day = ScheduleDay::Daily;
        config.transfer.hour = 14;

        let tracker = JobTracker::new();
        assert_eq!(run_due_jobs(&tracker, &config, at(6)).await, vec![JobKind::CameraCopy]);
        assert_eq!(run_due_jobs(&tracker, &config, at(9)).await, vec![]);
        assert_eq!(
            run_due_jobs(&tracker, &config, at(14)).await,
            vec![JobKind::CloudTransfer]
        );
    }

    #[tokio::test]
    async fn test_running_stage_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.transfer.method = TransferMethod::Ftp;
        config.transfer.day = ScheduleDay::Daily;
        config.transfer.hour = 14;

        let tracker = JobTracker::new();
        let (release, released) = oneshot::channel::<()>();
        tracker
            .submit(JobKind::CloudTransfer, |_| async move {
                let _ = released.await;
                JobSummary {
                    kind: JobKind::CloudTransfer,
                    status_line: String::new(),
                    outcome: JobOutcome::Succeeded { n: 0 },
                    duration: Duration::ZERO,
                    transferred_bytes: 0,
                }
            })
            .await
            .unwrap();

        assert!(run_due_jobs(&tracker, &config, at(14)).await.is_empty());
        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_off_days_never_fire() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let tracker = JobTracker::new();

        for hour in 0..24 {
            assert!(run_due_jobs(&tracker, &config, at(hour)).await.is_empty());
        }
        assert_eq!(tracker.active_count().await, 0);
    }
}
