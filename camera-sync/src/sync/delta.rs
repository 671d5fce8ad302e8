//! Delta calculation: which source files still need to move.
//!
//! The delta is a set difference between the source listing and everything
//! already handled (the manifest plus, for the camera stage, the rename log).
//! Results are deduplicated and sorted by identity so the same inputs always
//! produce the same work list.

use crate::device::DeviceEntry;
use crate::fs::metadata::to_local;
use crate::fs::walker::{walk_directory, WalkOptions};
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// One candidate unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    /// Stable manifest key: camera path or absolute local path
    pub identity: String,
    pub source_path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Local>,
}

impl TransferItem {
    pub fn from_device_entry(entry: &DeviceEntry) -> Self {
        Self {
            identity: entry.path.clone(),
            source_path: PathBuf::from(&entry.path),
            size: entry.size,
            modified_at: entry.modified,
        }
    }
}

/// List the local store as cloud-stage candidates, skipping control files.
pub fn local_candidates(root: &Path, options: WalkOptions) -> std::io::Result<Vec<TransferItem>> {
    let files = walk_directory(root, options)?;
    Ok(files
        .into_iter()
        .map(|file| TransferItem {
            identity: file.path.to_string_lossy().into_owned(),
            source_path: file.path,
            size: file.size,
            modified_at: to_local(file.modified),
        })
        .collect())
}

/// Candidates whose identity is in neither handled set.
pub fn compute_delta<I>(
    candidates: I,
    manifest: &HashSet<String>,
    renamed: &HashSet<String>,
) -> Vec<TransferItem>
where
    I: IntoIterator<Item = TransferItem>,
{
    let pending: BTreeMap<String, TransferItem> = candidates
        .into_iter()
        .filter(|item| !manifest.contains(&item.identity) && !renamed.contains(&item.identity))
        .map(|item| (item.identity.clone(), item))
        .collect();

    pending.into_values().collect()
}

/// Total bytes across a work list.
pub fn total_size(items: &[TransferItem]) -> u64 {
    items.iter().map(|item| item.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn item(identity: &str) -> TransferItem {
        TransferItem {
            identity: identity.to_string(),
            source_path: PathBuf::from(identity),
            size: 10,
            modified_at: Local::now(),
        }
    }

    fn set(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_delta_excludes_manifest_and_rename_log() {
        let candidates = vec![item("/c/a.jpg"), item("/c/b.jpg"), item("/c/c.jpg"), item("/c/d.jpg")];
        let delta = compute_delta(candidates, &set(&["/c/a.jpg"]), &set(&["/c/c.jpg"]));

        let ids: Vec<&str> = delta.iter().map(|i| i.identity.as_str()).collect();
        assert_eq!(ids, vec!["/c/b.jpg", "/c/d.jpg"]);
    }

    #[test]
    fn test_delta_is_order_independent() {
        let forward = vec![item("/c/a.jpg"), item("/c/b.jpg"), item("/c/c.jpg")];
        let mut backward = forward.clone();
        backward.reverse();
        backward.push(item("/c/b.jpg"));

        let manifest = set(&["/c/b.jpg"]);
        let empty = HashSet::new();
        assert_eq!(
            compute_delta(forward, &manifest, &empty),
            compute_delta(backward, &manifest, &empty)
        );
    }

    #[test]
    fn test_local_candidates_use_absolute_identity() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.jpg"), b"12345")?;
        fs::write(dir.path().join("uploadedOK.txt"), b"")?;

        let items = local_candidates(dir.path(), WalkOptions::default())?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].identity, dir.path().join("a.jpg").to_string_lossy());
        assert_eq!(total_size(&items), 5);
        Ok(())
    }
}
