//! Directory traversal for the local photo store and mounted camera stores.
//!
//! The walker only lists; it never opens file contents. Control files
//! (manifests, the rename log, hidden and system files) are filtered by name
//! and extension, and excluded directories are pruned rather than descended.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// Which entries a walk skips
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Exact file or directory names
    pub exclude_names: Vec<String>,
    /// Lower-case extensions without the dot
    pub exclude_extensions: Vec<String>,
    /// Names starting with `.`
    pub skip_hidden: bool,
}

impl Default for WalkOptions {
    /// Photo store rules: desktop and thumbnail folders, text and database files.
    fn default() -> Self {
        Self {
            exclude_names: vec![".directory".into(), ".thumbs".into()],
            exclude_extensions: vec!["txt".into(), "db".into()],
            skip_hidden: true,
        }
    }
}

impl WalkOptions {
    /// Photo store rules plus additional control file names.
    pub fn excluding<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = Self::default();
        options.exclude_names.extend(names.into_iter().map(Into::into));
        options
    }

    /// Camera store rules: only hidden entries are skipped.
    pub fn device() -> Self {
        Self {
            exclude_names: Vec::new(),
            exclude_extensions: Vec::new(),
            skip_hidden: true,
        }
    }

    fn skips(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        if self.skip_hidden && name.starts_with('.') {
            return true;
        }
        if self.exclude_names.iter().any(|excluded| *excluded == name) {
            return true;
        }
        if entry.file_type().is_dir() {
            return false;
        }

        Path::new(name.as_ref())
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.exclude_extensions.contains(&ext))
    }
}

/// A regular file found by the walk
#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub path: PathBuf,
    /// Path below the walk root
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Collect every regular file below `root` that `options` does not skip.
///
/// Symlinks to files are followed for their metadata; links to directories
/// and dangling links are ignored.
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<WalkedFile>> {
    let mut files = Vec::new();

    let entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !options.skips(entry));

    for entry in entries {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }

        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => target,
                _ => continue,
            }
        } else {
            entry.metadata()?
        };

        let path = entry.into_path();
        files.push(WalkedFile {
            relative_path: path.strip_prefix(root).unwrap_or(&path).to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified()?,
            path,
        });
    }

    Ok(files)
}
