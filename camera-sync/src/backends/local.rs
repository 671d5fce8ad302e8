//! Camera → local store copy.

use super::{BackendKind, TransferBackend, TransferError, TransferResult};
use crate::device::SourceDevice;
use crate::fs::metadata::preserve_modified;
use crate::fs::space::{violates_floor, FreeSpaceProbe};
use crate::sync::TransferItem;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct LocalCopyBackend {
    device: Arc<dyn SourceDevice>,
    probe: Arc<dyn FreeSpaceProbe>,
    reserved_free_bytes: u64,
}

impl LocalCopyBackend {
    pub fn new(
        device: Arc<dyn SourceDevice>,
        probe: Arc<dyn FreeSpaceProbe>,
        reserved_free_bytes: u64,
    ) -> Self {
        Self {
            device,
            probe,
            reserved_free_bytes,
        }
    }

    fn check_space(&self, destination: &Path, needed: u64) -> TransferResult<()> {
        let dir = destination.parent().unwrap_or_else(|| Path::new("."));
        let available = self
            .probe
            .available_bytes(dir)
            .map_err(|e| TransferError::from_io(BackendKind::LocalCopy, "free space check", &e))?;

        if violates_floor(available, needed, self.reserved_free_bytes) {
            return Err(TransferError::DiskFloor {
                available,
                needed,
                floor: self.reserved_free_bytes,
            });
        }
        Ok(())
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.part", name))
}

#[async_trait]
impl TransferBackend for LocalCopyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalCopy
    }

    async fn connect(&mut self) -> TransferResult<()> {
        Ok(())
    }

    async fn put(&mut self, item: &TransferItem, destination: &str) -> TransferResult<()> {
        let destination = Path::new(destination);
        let data = self
            .device
            .read_file(&item.identity)
            .await
            .map_err(|e| TransferError::source_unreadable(item.identity.as_str(), &e))?;

        // Re-checked per file: the store shares its disk with the camera's output
        self.check_space(destination, data.len() as u64)?;

        if let Some(dir) = destination.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| TransferError::from_io(BackendKind::LocalCopy, "create directory", &e))?;
        }

        let partial = partial_path(destination);
        let written = async {
            tokio::fs::write(&partial, &data).await?;
            tokio::fs::rename(&partial, destination).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::from_io(
                BackendKind::LocalCopy,
                &destination.display().to_string(),
                &e,
            ));
        }

        if let Err(e) = preserve_modified(destination, &item.modified_at) {
            warn!(path = %destination.display(), error = %e, "Failed to preserve modification time");
        }

        debug!(source = %item.identity, destination = %destination.display(), bytes = data.len(), "Copied");
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MountedCamera;
    use crate::fs::space::FixedSpace;
    use chrono::{Local, TimeZone};
    use std::fs;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn camera_with(file: &str, bytes: usize) -> (TempDir, Arc<dyn SourceDevice>, TransferItem) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(file.trim_start_matches('/'));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![7u8; bytes]).unwrap();

        let item = TransferItem {
            identity: file.to_string(),
            source_path: PathBuf::from(file),
            size: bytes as u64,
            modified_at: Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap(),
        };
        let device: Arc<dyn SourceDevice> = Arc::new(MountedCamera::new(dir.path()));
        (dir, device, item)
    }

    #[tokio::test]
    async fn test_copy_preserves_mtime() {
        let (_cam, device, item) = camera_with("/DCIM/100CANON/IMG_0001.JPG", 64);
        let store = TempDir::new().unwrap();
        let destination = store.path().join("DCIM/100CANON/IMG_0001.JPG");

        let mut backend = LocalCopyBackend::new(device, Arc::new(FixedSpace(u64::MAX)), 0);
        backend
            .put(&item, destination.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(fs::read(&destination).unwrap().len(), 64);
        let modified = crate::fs::metadata::modified_local(&destination).unwrap();
        assert_eq!(modified, item.modified_at);
        assert!(!partial_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_disk_floor_refuses_write() {
        let (_cam, device, item) = camera_with("/DCIM/100CANON/IMG_0002.JPG", (2 * MB) as usize);
        let store = TempDir::new().unwrap();
        let destination = store.path().join("IMG_0002.JPG");

        let mut backend = LocalCopyBackend::new(device, Arc::new(FixedSpace(5 * MB)), 10 * MB);
        let err = backend
            .put(&item, destination.to_str().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::DiskFloor { .. }));
        assert!(!err.is_transient());
        assert!(!destination.exists());
    }
}
