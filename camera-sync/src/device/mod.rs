//! Source devices: the camera's file store.
//!
//! The camera is reached through [`SourceDevice`]. Access must be claimed
//! before listing or reading, because the USB-attached camera does not support
//! concurrent sessions.

pub mod waker;

use crate::fs::metadata::to_local;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

pub use waker::{CommandWaker, DeviceWaker, NoopWaker};

/// A file on the device, addressed by its device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Absolute device path, e.g. `/store_00010001/DCIM/100CANON/IMG_0001.JPG`
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Local>,
}

#[async_trait]
pub trait SourceDevice: Send + Sync {
    /// Human-readable name for logs and status messages
    fn describe(&self) -> String;

    /// Acquire exclusive access. Fails while the device is asleep or busy.
    async fn claim(&self) -> Result<()>;

    async fn release(&self);

    async fn list_files(&self) -> Result<Vec<DeviceEntry>>;

    async fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>>;

    async fn delete_file(&self, path: &str) -> std::io::Result<()>;
}

/// A camera whose storage is mounted into the local filesystem
/// (USB mass storage or a gphoto2 FUSE mount).
#[derive(Debug)]
pub struct MountedCamera {
    root: PathBuf,
    claimed: AtomicBool,
}

impl MountedCamera {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claimed: AtomicBool::new(false),
        }
    }

    /// Map a device path onto the mount, refusing `..` escapes.
    fn local_path(&self, device_path: &str) -> std::io::Result<PathBuf> {
        let relative = Path::new(device_path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid device path: {}", device_path),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SourceDevice for MountedCamera {
    fn describe(&self) -> String {
        format!("camera at {}", self.root.display())
    }

    async fn claim(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            SyncError::Device(format!("{} is not available: {}", self.root.display(), e))
        })?;

        // An unmounted mount point is an empty directory
        if entries.next_entry().await?.is_none() {
            return Err(SyncError::Device(format!(
                "{} is empty; camera not mounted",
                self.root.display()
            )));
        }

        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Device(format!("{} is busy", self.describe())));
        }

        info!(root = %self.root.display(), "Camera claimed");
        Ok(())
    }

    async fn release(&self) {
        if self.claimed.swap(false, Ordering::AcqRel) {
            debug!(root = %self.root.display(), "Camera released");
        }
    }

    async fn list_files(&self) -> Result<Vec<DeviceEntry>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || walk_directory(&root, WalkOptions::device()))
            .await
            .map_err(|e| SyncError::Device(format!("listing task failed: {}", e)))??;

        Ok(files
            .into_iter()
            .map(|file| {
                let segments: Vec<String> = file
                    .relative_path
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                DeviceEntry {
                    path: format!("/{}", segments.join("/")),
                    size: file.size,
                    modified: to_local(file.modified),
                }
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.local_path(path)?).await
    }

    async fn delete_file(&self, path: &str) -> std::io::Result<()> {
        tokio::fs::remove_file(self.local_path(path)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_claim_requires_mounted_store() {
        let dir = TempDir::new().unwrap();
        let camera = MountedCamera::new(dir.path());
        assert!(matches!(camera.claim().await, Err(SyncError::Device(_))));

        fs::create_dir(dir.path().join("DCIM")).unwrap();
        camera.claim().await.unwrap();

        // second claim while held
        assert!(camera.claim().await.is_err());
        camera.release().await;
        camera.claim().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_read_delete() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("store_00010001/DCIM/100CANON")).unwrap();
        fs::write(dir.path().join("store_00010001/DCIM/100CANON/IMG_0001.JPG"), b"jpeg").unwrap();

        let camera = MountedCamera::new(dir.path());
        let files = camera.list_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "/store_00010001/DCIM/100CANON/IMG_0001.JPG");
        assert_eq!(files[0].size, 4);

        let data = camera.read_file(&files[0].path).await.unwrap();
        assert_eq!(data, b"jpeg");

        camera.delete_file(&files[0].path).await.unwrap();
        assert!(camera.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let dir = TempDir::new().unwrap();
        let camera = MountedCamera::new(dir.path());
        assert!(camera.read_file("/../etc/passwd").await.is_err());
    }
}
