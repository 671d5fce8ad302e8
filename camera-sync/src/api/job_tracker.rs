//! Job tracking for submitted copy and transfer jobs.
//!
//! Only the most recent job of each kind is kept; submitting a new one
//! replaces the finished entry and superseded ids stop resolving.

use crate::executor::{JobKind, JobOutcome, JobSummary};
use crate::transfer::ProgressSink;
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

/// What a poll returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub message: String,
}

impl JobStatus {
    /// Final status for a finished job. A partial failure still counts as
    /// succeeded; its tally says how much got through.
    pub fn from_summary(summary: &JobSummary) -> Self {
        let state = match summary.outcome {
            JobOutcome::Aborted { .. } => JobState::Failed,
            JobOutcome::Succeeded { .. } | JobOutcome::PartialFailure { .. } => JobState::Succeeded,
        };
        Self {
            state,
            message: summary.status_line.clone(),
        }
    }
}

#[derive(Debug)]
struct TrackedJob {
    id: String,
    status: JobStatus,
}

/// Tracks the latest job per kind and runs jobs in the background
#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<JobKind, TrackedJob>>>,
    shutdown: CancellationToken,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_shutdown(CancellationToken::new())
    }

    /// Jobs see `shutdown` and stop between items once it fires.
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Token handed to executors
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Start `job` in the background and return its id.
    ///
    /// Fails with `AlreadyRunning` while another job of the same kind is
    /// pending or running.
    pub async fn submit<F, Fut>(&self, kind: JobKind, job: F) -> Result<String>
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = JobSummary> + Send + 'static,
    {
        let job_id = Uuid::new_v4().to_string();
        {
            let mut jobs = self.jobs.write().await;
            if jobs.get(&kind).is_some_and(|tracked| tracked.status.state.is_active()) {
                return Err(SyncError::AlreadyRunning(kind));
            }
            jobs.insert(
                kind,
                TrackedJob {
                    id: job_id.clone(),
                    status: JobStatus {
                        state: JobState::Pending,
                        message: "Queued".to_string(),
                    },
                },
            );
        }

        let reporter = ProgressReporter {
            tracker: self.clone(),
            kind,
            job_id: job_id.clone(),
        };
        let work = job(reporter);

        let tracker = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            tracker
                .set_status(kind, &id, JobState::Running, "Starting".to_string())
                .await;

            // Run in its own task so a panic lands here as a JoinError
            let status = match tokio::spawn(work).await {
                Ok(summary) => JobStatus::from_summary(&summary),
                Err(e) => {
                    error!(job_id = %id, kind = %kind, error = %e, "Job task failed");
                    JobStatus {
                        state: JobState::Failed,
                        message: format!("Job stopped unexpectedly: {}", e),
                    }
                }
            };

            info!(job_id = %id, kind = %kind, state = ?status.state, "Job finished");
            tracker.set_status(kind, &id, status.state, status.message).await;
        });

        info!(job_id = %job_id, kind = %kind, "Job submitted");
        Ok(job_id)
    }

    /// Status of `job_id`, if it is still the latest of its kind.
    pub async fn poll(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .find(|tracked| tracked.id == job_id)
            .map(|tracked| tracked.status.clone())
    }

    /// Latest job of `kind` with its id
    pub async fn latest(&self, kind: JobKind) -> Option<(String, JobStatus)> {
        let jobs = self.jobs.read().await;
        jobs.get(&kind)
            .map(|tracked| (tracked.id.clone(), tracked.status.clone()))
    }

    /// Get count of pending or running jobs
    pub async fn active_count(&self) -> usize {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|tracked| tracked.status.state.is_active())
            .count()
    }

    async fn set_status(&self, kind: JobKind, job_id: &str, state: JobState, message: String) {
        let mut jobs = self.jobs.write().await;
        if let Some(tracked) = jobs.get_mut(&kind) {
            if tracked.id == job_id {
                tracked.status = JobStatus { state, message };
            }
        }
    }

    async fn set_message(&self, kind: JobKind, job_id: &str, message: String) {
        let mut jobs = self.jobs.write().await;
        if let Some(tracked) = jobs.get_mut(&kind) {
            if tracked.id == job_id && tracked.status.state.is_active() {
                tracked.status.message = message;
            }
        }
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress sink bound to one tracked job
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: JobTracker,
    kind: JobKind,
    job_id: String,
}

impl ProgressReporter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.tracker.cancellation()
    }
}

#[async_trait]
impl ProgressSink for ProgressReporter {
    async fn update(&self, message: String) {
        self.tracker.set_message(self.kind, &self.job_id, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn summary(kind: JobKind, outcome: JobOutcome) -> JobSummary {
        JobSummary {
            kind,
            status_line: outcome.status_line(kind),
            outcome,
            duration: Duration::ZERO,
            transferred_bytes: 0,
        }
    }

    async fn wait_for(tracker: &JobTracker, id: &str, state: JobState) -> JobStatus {
        for _ in 0..200 {
            if let Some(status) = tracker.poll(id).await {
                if status.state == state {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}", id, state);
    }

    #[tokio::test]
    async fn test_job_lifecycle_and_kind_lock() {
        let tracker = JobTracker::new();
        let (release, released) = oneshot::channel::<()>();

        let id = tracker
            .submit(JobKind::CloudTransfer, |reporter| async move {
                reporter.update("Uploading item 1 of 2".to_string()).await;
                let _ = released.await;
                summary(JobKind::CloudTransfer, JobOutcome::Succeeded { n: 2 })
            })
            .await
            .unwrap();

        wait_for(&tracker, &id, JobState::Running).await;
        assert_eq!(tracker.active_count().await, 1);

        let second = tracker
            .submit(JobKind::CloudTransfer, |_| async {
                summary(JobKind::CloudTransfer, JobOutcome::Succeeded { n: 0 })
            })
            .await;
        assert!(matches!(second, Err(SyncError::AlreadyRunning(JobKind::CloudTransfer))));

        release.send(()).unwrap();
        let done = wait_for(&tracker, &id, JobState::Succeeded).await;
        assert_eq!(done.message, "2 of 2 files uploaded OK");
        assert_eq!(tracker.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_kinds_are_independent() {
        let tracker = JobTracker::new();
        let (_hold, held) = oneshot::channel::<()>();

        tracker
            .submit(JobKind::CameraCopy, |_| async move {
                let _ = held.await;
                summary(JobKind::CameraCopy, JobOutcome::Succeeded { n: 1 })
            })
            .await
            .unwrap();

        let other = tracker
            .submit(JobKind::CloudTransfer, |_| async {
                summary(JobKind::CloudTransfer, JobOutcome::Succeeded { n: 0 })
            })
            .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_outcomes_map_to_states() {
        let tracker = JobTracker::new();

        let partial = tracker
            .submit(JobKind::CloudTransfer, |_| async {
                summary(JobKind::CloudTransfer, JobOutcome::PartialFailure { ok: 2, total: 3 })
            })
            .await
            .unwrap();
        let status = wait_for(&tracker, &partial, JobState::Succeeded).await;
        assert_eq!(status.message, "2 of 3 files uploaded OK");

        let aborted = tracker
            .submit(JobKind::CameraCopy, |_| async {
                summary(
                    JobKind::CameraCopy,
                    JobOutcome::Aborted {
                        reason: "camera at /media/camera not available after 6 attempts".into(),
                        ok: 0,
                        total: 0,
                    },
                )
            })
            .await
            .unwrap();
        let status = wait_for(&tracker, &aborted, JobState::Failed).await;
        assert_eq!(status.message, "camera at /media/camera not available after 6 attempts");
    }

    #[tokio::test]
    async fn test_panicking_job_is_failed() {
        let tracker = JobTracker::new();
        let id = tracker
            .submit(JobKind::CameraCopy, |_| async {
                if true {
                    panic!("device driver crashed");
                }
                summary(JobKind::CameraCopy, JobOutcome::Succeeded { n: 0 })
            })
            .await
            .unwrap();

        let status = wait_for(&tracker, &id, JobState::Failed).await;
        assert!(status.message.starts_with("Job stopped unexpectedly"));
    }

    #[tokio::test]
    async fn test_superseded_ids_stop_resolving() {
        let tracker = JobTracker::new();
        let first = tracker
            .submit(JobKind::CloudTransfer, |_| async {
                summary(JobKind::CloudTransfer, JobOutcome::Succeeded { n: 0 })
            })
            .await
            .unwrap();
        wait_for(&tracker, &first, JobState::Succeeded).await;

        let second = tracker
            .submit(JobKind::CloudTransfer, |_| async {
                summary(JobKind::CloudTransfer, JobOutcome::Succeeded { n: 0 })
            })
            .await
            .unwrap();

        assert!(tracker.poll(&first).await.is_none());
        assert!(tracker.poll(&second).await.is_some());
        assert_eq!(tracker.latest(JobKind::CloudTransfer).await.unwrap().0, second);
    }
}
