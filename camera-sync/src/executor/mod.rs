//! Transfer job executor - Orchestrates camera copies and cloud uploads.
//!
//! A job moves through `Preparing → Enumerating → TransferringItem(i)` and
//! ends as `Succeeded`, `PartialFailure` or `Aborted`:
//! - Preparing claims the camera (copy stage) or connects the backend
//! - Enumerating computes the delta against the manifest
//! - each item is transferred with the retry policy, then immediately
//!   recorded in the manifest (or its source deleted)
//!
//! Transient per-item failures are counted and skipped. A permanent failure
//! aborts the rest of the job; items already recorded stay recorded.

pub mod manifest;
pub mod retry;

use crate::backends::{
    build_backend, LocalCopyBackend, TransferBackend, TransferMode, TransferResult,
};
use crate::config::{Config, CopyConfig};
use crate::device::{waker, DeviceWaker, MountedCamera, SourceDevice};
use crate::fs::space::{FreeSpaceProbe, StatvfsProbe};
use crate::fs::walker::WalkOptions;
use crate::sync::delta::{local_candidates, total_size};
use crate::sync::paths::{local_destination, remote_destination};
use crate::sync::rename::{RenameOutcome, RenameTemplate};
use crate::sync::{compute_delta, TransferItem};
use crate::transfer::progress::{format_bytes, format_duration, format_speed};
use crate::transfer::{ItemProgress, ProgressSink};
use crate::utils::errors::Result;
use manifest::{ManifestStore, RenameLog, COPY_MANIFEST, RENAME_LOG, UPLOAD_MANIFEST};
use retry::{ClaimPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The two kinds of job; at most one of each runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Camera → local photo store
    CameraCopy,
    /// Local photo store → remote backend
    CloudTransfer,
}

impl JobKind {
    /// Past tense used in status lines
    pub fn verb(&self) -> &'static str {
        match self {
            JobKind::CameraCopy => "copied",
            JobKind::CloudTransfer => "uploaded",
        }
    }

    fn progress_verb(&self) -> &'static str {
        match self {
            JobKind::CameraCopy => "Copying",
            JobKind::CloudTransfer => "Uploading",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::CameraCopy => f.write_str("camera copy"),
            JobKind::CloudTransfer => f.write_str("cloud transfer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Preparing,
    Enumerating,
    TransferringItem(usize),
    Finished,
}

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { n: usize },
    PartialFailure { ok: usize, total: usize },
    Aborted { reason: String, ok: usize, total: usize },
}

impl JobOutcome {
    /// One human-readable line for the operator.
    pub fn status_line(&self, kind: JobKind) -> String {
        let verb = kind.verb();
        match self {
            JobOutcome::Succeeded { n: 0 } => format!("No files need to be {}", verb),
            JobOutcome::Succeeded { n } => format!("{} of {} files {} OK", n, n, verb),
            JobOutcome::PartialFailure { ok, total } => {
                format!("{} of {} files {} OK", ok, total, verb)
            }
            JobOutcome::Aborted { reason, total: 0, .. } => reason.clone(),
            JobOutcome::Aborted { reason, ok, total } => {
                format!("{}. {} of {} files {} OK", reason, ok, total, verb)
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, JobOutcome::Aborted { .. })
    }
}

/// Working state of one job
#[derive(Debug)]
pub struct TransferJob {
    pub kind: JobKind,
    pub items: Vec<TransferItem>,
    pub attempted: usize,
    pub succeeded: usize,
    pub phase: JobPhase,
    pub transferred_bytes: u64,
}

impl TransferJob {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
            attempted: 0,
            succeeded: 0,
            phase: JobPhase::Preparing,
            transferred_bytes: 0,
        }
    }

    fn enter(&mut self, phase: JobPhase) {
        debug!(kind = %self.kind, phase = ?phase, "Job phase");
        self.phase = phase;
    }

    fn confirm(&mut self, item: &TransferItem) {
        self.succeeded += 1;
        self.transferred_bytes += item.size;
    }

    fn abort(&self, reason: impl Into<String>) -> JobOutcome {
        JobOutcome::Aborted {
            reason: reason.into(),
            ok: self.succeeded,
            total: self.items.len(),
        }
    }

    fn finish(&self) -> JobOutcome {
        if self.succeeded == self.items.len() {
            JobOutcome::Succeeded { n: self.succeeded }
        } else {
            JobOutcome::PartialFailure {
                ok: self.succeeded,
                total: self.items.len(),
            }
        }
    }
}

/// Job execution result
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub kind: JobKind,
    pub outcome: JobOutcome,
    pub status_line: String,
    pub duration: Duration,
    pub transferred_bytes: u64,
}

/// Collaborators of a camera copy
pub struct CameraCopyJob {
    pub device: Arc<dyn SourceDevice>,
    pub waker: Arc<dyn DeviceWaker>,
    pub probe: Arc<dyn FreeSpaceProbe>,
}

impl CameraCopyJob {
    pub fn new(
        device: Arc<dyn SourceDevice>,
        waker: Arc<dyn DeviceWaker>,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> Self {
        Self {
            device,
            waker,
            probe,
        }
    }

    /// Mounted camera, configured wake command and `statvfs` free-space checks.
    pub fn from_config(config: &CopyConfig) -> Self {
        Self {
            device: Arc::new(MountedCamera::new(&config.device_root)),
            waker: waker::from_argv(&config.wake_command),
            probe: Arc::new(StatvfsProbe),
        }
    }
}

/// Runs jobs, reporting progress to a sink
pub struct TransferExecutor {
    progress: Arc<dyn ProgressSink>,
    cancel_token: CancellationToken,
}

impl TransferExecutor {
    /// Create a new executor (no cancellation support)
    pub fn new(progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            progress,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Create a new executor that stops between items once `cancel_token` fires
    pub fn with_cancel(progress: Arc<dyn ProgressSink>, cancel_token: CancellationToken) -> Self {
        Self {
            progress,
            cancel_token,
        }
    }

    /// Upload the photo store with the configured backend.
    pub async fn run_cloud_transfer(&self, config: &Config) -> JobSummary {
        match build_backend(&config.transfer) {
            Ok(backend) => self.run_cloud_transfer_with(config, backend).await,
            Err(e) => {
                warn!(error = %e, "Transfers disabled");
                let job = TransferJob::new(JobKind::CloudTransfer);
                self.summarize(&job, job.abort(e.to_string()), Instant::now())
                    .await
            }
        }
    }

    /// Upload the photo store with an already-built backend.
    pub async fn run_cloud_transfer_with(
        &self,
        config: &Config,
        mut backend: Box<dyn TransferBackend>,
    ) -> JobSummary {
        let start_time = Instant::now();
        let mut job = TransferJob::new(JobKind::CloudTransfer);
        info!(backend = %backend.kind(), "Starting cloud transfer");

        let outcome = self.cloud_transfer(config, backend.as_mut(), &mut job).await;
        backend.close().await;

        self.summarize(&job, outcome, start_time).await
    }

    /// Copy new images off the camera into the photo store.
    pub async fn run_camera_copy(&self, config: &Config, camera: CameraCopyJob) -> JobSummary {
        let start_time = Instant::now();
        let mut job = TransferJob::new(JobKind::CameraCopy);
        info!(device = %camera.device.describe(), "Starting camera copy");

        let outcome = self.camera_copy(config, &camera, &mut job).await;
        self.summarize(&job, outcome, start_time).await
    }

    async fn summarize(&self, job: &TransferJob, outcome: JobOutcome, start_time: Instant) -> JobSummary {
        let duration = start_time.elapsed();
        let status_line = outcome.status_line(job.kind);
        let speed = if duration.as_secs_f64() > 0.0 {
            (job.transferred_bytes as f64 / duration.as_secs_f64()) as u64
        } else {
            0
        };

        info!(
            kind = %job.kind,
            attempted = job.attempted,
            succeeded = job.succeeded,
            bytes = %format_bytes(job.transferred_bytes),
            speed = %format_speed(speed),
            duration = %format_duration(duration),
            "Job finished"
        );
        if outcome.is_aborted() {
            error!("STATUS: {}", status_line);
        } else {
            info!("STATUS: {}", status_line);
        }
        self.progress.update(status_line.clone()).await;

        JobSummary {
            kind: job.kind,
            outcome,
            status_line,
            duration,
            transferred_bytes: job.transferred_bytes,
        }
    }

    async fn cloud_transfer(
        &self,
        config: &Config,
        backend: &mut dyn TransferBackend,
        job: &mut TransferJob,
    ) -> JobOutcome {
        job.enter(JobPhase::Preparing);
        let photos_dir = &config.paths.photos_dir;

        let mut manifest = match open_manifest(&photos_dir.join(UPLOAD_MANIFEST)) {
            Ok(manifest) => manifest,
            Err(e) => return job.abort(e.to_string()),
        };

        let retry = RetryPolicy::from_config(&config.transfer);
        if let Err(e) = connect_with_retry(backend, retry).await {
            error!(backend = %backend.kind(), error = %e, "Connect failed");
            return job.abort(e.to_string());
        }

        job.enter(JobPhase::Enumerating);
        let root = photos_dir.clone();
        let options = WalkOptions::excluding([COPY_MANIFEST, UPLOAD_MANIFEST, RENAME_LOG]);
        let candidates =
            match tokio::task::spawn_blocking(move || local_candidates(&root, options)).await {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(e)) => {
                    return job.abort(format!("Cannot list {}: {}", photos_dir.display(), e))
                }
                Err(e) => return job.abort(format!("Listing task failed: {}", e)),
            };

        job.items = compute_delta(candidates, manifest.identities(), &HashSet::new());
        if job.items.is_empty() {
            return job.finish();
        }
        info!(
            files = job.items.len(),
            bytes = %format_bytes(total_size(&job.items)),
            "Files to upload"
        );

        let mut progress = ItemProgress::new(
            job.kind.progress_verb(),
            job.items.len(),
            total_size(&job.items),
        );

        if backend.mode() == TransferMode::Batch {
            return self
                .cloud_batch(config, backend, job, &mut manifest, retry)
                .await;
        }

        let remote_root = config.transfer.remote_folder().to_string();
        for index in 0..job.items.len() {
            if self.cancel_token.is_cancelled() {
                return job.abort("Cancelled");
            }

            let item = job.items[index].clone();
            job.enter(JobPhase::TransferringItem(index));
            self.progress.update(progress.message(index)).await;

            let destination = remote_destination(&item.source_path, &remote_root);
            job.attempted += 1;

            match put_with_retry(backend, &item, &destination, retry).await {
                Ok(()) => {
                    if let Err(e) = settle_upload(config, &mut manifest, &item).await {
                        error!(path = %item.identity, error = %e, "Manifest update failed");
                        return job.abort(e.to_string());
                    }
                    job.confirm(&item);
                    let percent = progress.complete(item.size);
                    debug!(path = %item.identity, destination = %destination, percent, "Uploaded");
                }
                Err(e) if e.skips_item() => {
                    warn!(path = %item.identity, backend = %backend.kind(), error = %e, "Upload failed, skipping");
                }
                Err(e) => {
                    error!(path = %item.identity, backend = %backend.kind(), error = %e, "Upload failed, aborting");
                    return job.abort(e.to_string());
                }
            }
        }

        job.enter(JobPhase::Finished);
        job.finish()
    }

    /// Single pass for batch backends; only confirmed names are recorded.
    async fn cloud_batch(
        &self,
        config: &Config,
        backend: &mut dyn TransferBackend,
        job: &mut TransferJob,
        manifest: &mut ManifestStore,
        retry: RetryPolicy,
    ) -> JobOutcome {
        job.enter(JobPhase::TransferringItem(0));
        job.attempted = job.items.len();
        self.progress
            .update(format!("Uploading {} files", job.items.len()))
            .await;

        let mut attempt = 1;
        let sent = loop {
            match backend.put_batch(&config.paths.photos_dir, &job.items).await {
                Ok(sent) => break sent,
                Err(e) => match retry.next_delay(attempt, &e) {
                    Some(delay) => {
                        warn!(attempt, backend = %backend.kind(), error = %e, "Batch transfer failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        error!(backend = %backend.kind(), error = %e, "Batch transfer failed");
                        return job.abort(e.to_string());
                    }
                },
            }
        };

        let sent: HashSet<String> = sent.into_iter().collect();
        let confirmed: Vec<TransferItem> = job
            .items
            .iter()
            .filter(|item| sent.contains(&item.identity))
            .cloned()
            .collect();

        for item in &confirmed {
            if let Err(e) = settle_upload(config, manifest, item).await {
                error!(path = %item.identity, error = %e, "Manifest update failed");
                return job.abort(e.to_string());
            }
            job.confirm(item);
        }

        job.enter(JobPhase::Finished);
        job.finish()
    }

    async fn camera_copy(&self, config: &Config, camera: &CameraCopyJob, job: &mut TransferJob) -> JobOutcome {
        job.enter(JobPhase::Preparing);
        let photos_dir = &config.paths.photos_dir;

        if let Err(e) = tokio::fs::create_dir_all(photos_dir).await {
            return job.abort(format!("Cannot create {}: {}", photos_dir.display(), e));
        }

        let template = if config.copy.rename {
            match RenameTemplate::new(config.copy.rename_template.as_str()) {
                Ok(template) => Some(template),
                Err(e) => return job.abort(e.to_string()),
            }
        } else {
            None
        };

        let manifest = open_manifest(&photos_dir.join(COPY_MANIFEST));
        let renames = RenameLog::load(photos_dir.join(RENAME_LOG));
        let (mut manifest, mut renames) = match (manifest, renames) {
            (Ok(manifest), Ok(renames)) => (manifest, renames),
            (Err(e), _) | (_, Err(e)) => return job.abort(e.to_string()),
        };

        let claim = ClaimPolicy::from_config(&config.copy);
        if let Err(e) = claim
            .claim_device(camera.device.as_ref(), camera.waker.as_ref())
            .await
        {
            error!(error = %e, "Camera not available");
            return job.abort(e.to_string());
        }

        let outcome = self
            .copy_claimed(config, camera, job, template.as_ref(), &mut manifest, &mut renames)
            .await;
        camera.device.release().await;
        outcome
    }

    async fn copy_claimed(
        &self,
        config: &Config,
        camera: &CameraCopyJob,
        job: &mut TransferJob,
        template: Option<&RenameTemplate>,
        manifest: &mut ManifestStore,
        renames: &mut RenameLog,
    ) -> JobOutcome {
        job.enter(JobPhase::Enumerating);
        let entries = match camera.device.list_files().await {
            Ok(entries) => entries,
            Err(e) => return job.abort(format!("Cannot list camera files: {}", e)),
        };

        job.items = compute_delta(
            entries.iter().map(TransferItem::from_device_entry),
            manifest.identities(),
            renames.originals(),
        );
        if job.items.is_empty() {
            return job.finish();
        }
        info!(
            files = job.items.len(),
            bytes = %format_bytes(total_size(&job.items)),
            "Files to copy"
        );

        let mut backend = LocalCopyBackend::new(
            camera.device.clone(),
            camera.probe.clone(),
            config.copy.reserved_free_bytes,
        );
        let retry = RetryPolicy::from_config(&config.transfer);
        let mut progress = ItemProgress::new(
            job.kind.progress_verb(),
            job.items.len(),
            total_size(&job.items),
        );

        for index in 0..job.items.len() {
            if self.cancel_token.is_cancelled() {
                return job.abort("Cancelled");
            }

            let item = job.items[index].clone();
            job.enter(JobPhase::TransferringItem(index));
            self.progress.update(progress.message(index)).await;

            let original = match local_destination(&item.source_path, &config.paths.photos_dir) {
                Ok(path) => path,
                Err(e) => {
                    return job.abort(format!("Cannot prepare destination for {}: {}", item.identity, e))
                }
            };

            let destination = match template {
                Some(template) => match template.apply(&original, &item.modified_at, config.copy.rename_max_attempts) {
                    RenameOutcome::Renamed(path) => path,
                    RenameOutcome::CapExceeded(path) => {
                        warn!(
                            path = %item.identity,
                            cap = config.copy.rename_max_attempts,
                            "No free name within the rename cap, keeping original name"
                        );
                        path
                    }
                },
                None => original.clone(),
            };
            let renamed = destination != original;
            job.attempted += 1;

            if !renamed && destination.exists() {
                // Never overwrite what is already in the store
                info!(path = %item.identity, destination = %destination.display(), "Already in photo store");
                if let Err(e) = manifest.record(&item.identity) {
                    return job.abort(e.to_string());
                }
                job.succeeded += 1;
                continue;
            }

            let target = destination.to_string_lossy().into_owned();
            if renamed {
                // Never copy what the rename log cannot record
                if let Err(e) = RenameLog::check(&item.identity, &target) {
                    warn!(path = %item.identity, error = %e, "Cannot log rename, skipping");
                    continue;
                }
            }
            match put_with_retry(&mut backend, &item, &target, retry).await {
                Ok(()) => {
                    if renamed {
                        if let Err(e) = renames.record(&item.identity, &target) {
                            return job.abort(e.to_string());
                        }
                        info!(original = %item.identity, renamed = %target, "Renamed on copy");
                    }
                    if let Err(e) = settle_copy(config, camera.device.as_ref(), manifest, &item).await {
                        error!(path = %item.identity, error = %e, "Manifest update failed");
                        return job.abort(e.to_string());
                    }
                    job.confirm(&item);
                    let percent = progress.complete(item.size);
                    debug!(path = %item.identity, destination = %target, percent, "Copied");
                }
                Err(e) if e.skips_item() => {
                    warn!(path = %item.identity, error = %e, "Copy failed, skipping");
                }
                Err(e) => {
                    error!(path = %item.identity, error = %e, "Copy failed, aborting");
                    return job.abort(e.to_string());
                }
            }
        }

        job.enter(JobPhase::Finished);
        job.finish()
    }
}

/// Load a manifest, repairing it first if interrupted writes left it inconsistent.
fn open_manifest(path: &Path) -> Result<ManifestStore> {
    let mut manifest = ManifestStore::load(path)?;
    if !manifest.is_consistent()? {
        let report = manifest.repair()?;
        info!(
            path = %path.display(),
            duplicates = report.duplicates,
            malformed = report.malformed,
            "Repaired manifest before transfer"
        );
    }
    Ok(manifest)
}

async fn connect_with_retry(backend: &mut dyn TransferBackend, retry: RetryPolicy) -> TransferResult<()> {
    let mut attempt = 1;
    loop {
        match backend.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => match retry.next_delay(attempt, &e) {
                Some(delay) => {
                    warn!(attempt, backend = %backend.kind(), error = %e, "Connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

async fn put_with_retry(
    backend: &mut dyn TransferBackend,
    item: &TransferItem,
    destination: &str,
    retry: RetryPolicy,
) -> TransferResult<()> {
    let mut attempt = 1;
    loop {
        match backend.put(item, destination).await {
            Ok(()) => return Ok(()),
            Err(e) => match retry.next_delay(attempt, &e) {
                Some(delay) => {
                    warn!(attempt, path = %item.identity, backend = %backend.kind(), error = %e, "Transfer failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

/// After a confirmed upload: delete the source and its sidecars, or record it.
async fn settle_upload(config: &Config, manifest: &mut ManifestStore, item: &TransferItem) -> Result<()> {
    if config.transfer.delete_after_transfer {
        match tokio::fs::remove_file(&item.source_path).await {
            Ok(()) => {
                for sidecar in sidecars(&config.paths.photos_dir, &config.paths.thumbs_dir, &item.source_path) {
                    match tokio::fs::remove_file(&sidecar).await {
                        Ok(()) => debug!(path = %sidecar.display(), "Deleted sidecar"),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(path = %sidecar.display(), error = %e, "Failed to delete sidecar"),
                    }
                }
                return Ok(());
            }
            Err(e) => {
                warn!(path = %item.identity, error = %e, "Delete after transfer failed, recording instead");
            }
        }
    }
    manifest.record(&item.identity)
}

/// After a confirmed copy: delete the camera file, or record it.
async fn settle_copy(
    config: &Config,
    device: &dyn SourceDevice,
    manifest: &mut ManifestStore,
    item: &TransferItem,
) -> Result<()> {
    if config.copy.delete_after_copy {
        match device.delete_file(&item.identity).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(path = %item.identity, error = %e, "Delete from camera failed, recording instead");
            }
        }
    }
    manifest.record(&item.identity)
}

/// Thumbnail and metadata files derived from `source`, mirrored under `thumbs_dir`.
fn sidecars(photos_dir: &Path, thumbs_dir: &Path, source: &Path) -> Vec<PathBuf> {
    let Ok(relative) = source.strip_prefix(photos_dir) else {
        return Vec::new();
    };
    let (Some(stem), parent) = (relative.file_stem(), relative.parent()) else {
        return Vec::new();
    };
    let stem = stem.to_string_lossy();
    let extension = relative
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let dir = match parent {
        Some(parent) => thumbs_dir.join(parent),
        None => thumbs_dir.to_path_buf(),
    };
    vec![
        dir.join(format!("{}-thumb{}", stem, extension)),
        dir.join(format!("{}.json", stem)),
    ]
}
