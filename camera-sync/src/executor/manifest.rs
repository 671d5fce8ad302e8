//! Manifest and rename-log stores for incremental transfers.
//!
//! A manifest is a plain-text file holding one handled source identity per
//! line. It is append-only during normal operation; `repair()` rewrites it
//! when interrupted or concurrent appends left duplicate or truncated lines.

use crate::utils::errors::{Result, SyncError};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Manifest of identities already copied off the camera.
pub const COPY_MANIFEST: &str = "copiedOK.txt";
/// Manifest of local files already uploaded.
pub const UPLOAD_MANIFEST: &str = "uploadedOK.txt";
/// Original → new name mappings written by the rename policy.
pub const RENAME_LOG: &str = "renamedOK.txt";

/// File-backed set of handled identities.
///
/// The in-memory set is a point-in-time snapshot taken at `load`, extended by
/// this instance's own `record` calls.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    entries: HashSet<String>,
}

/// What `repair` changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub kept: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

impl ManifestStore {
    /// Load a manifest; a missing file is an empty manifest.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = read_lines(&path)?
            .into_iter()
            .filter_map(|(line, terminated)| {
                (terminated && is_valid_identity(&line)).then_some(line)
            })
            .collect();

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identities(&self) -> &HashSet<String> {
        &self.entries
    }

    /// Append an identity. The line is written with a single append so a
    /// concurrent reader never sees a partially interleaved record.
    pub fn record(&mut self, identity: &str) -> Result<()> {
        if !is_valid_identity(identity) {
            return Err(SyncError::InvalidIdentity(identity.to_string()));
        }
        if self.entries.contains(identity) {
            return Ok(());
        }

        append_line(&self.path, identity)?;
        self.entries.insert(identity.to_string());
        Ok(())
    }

    /// True when every line is a valid, unique, newline-terminated identity.
    pub fn is_consistent(&self) -> Result<bool> {
        let mut seen = HashSet::new();
        for (line, terminated) in read_lines(&self.path)? {
            if !terminated || !is_valid_identity(&line) || !seen.insert(line) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rewrite the backing file as a unique set of valid identities.
    ///
    /// Duplicates collapse to their last occurrence; blank lines, lines with
    /// control characters and an unterminated trailing line are dropped.
    pub fn repair(&mut self) -> Result<RepairReport> {
        let lines = read_lines(&self.path)?;
        let mut report = RepairReport::default();

        let mut valid = Vec::with_capacity(lines.len());
        for (line, terminated) in lines {
            if terminated && is_valid_identity(&line) {
                valid.push(line);
            } else {
                report.malformed += 1;
            }
        }

        let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(valid.len());
        for (idx, line) in valid.iter().enumerate() {
            last_seen.insert(line.as_str(), idx);
        }

        let mut kept = Vec::with_capacity(last_seen.len());
        for (idx, line) in valid.iter().enumerate() {
            if last_seen.get(line.as_str()) == Some(&idx) {
                kept.push(line.clone());
            } else {
                report.duplicates += 1;
            }
        }
        report.kept = kept.len();

        let mut content = kept.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        write_atomically(&self.path, content.as_bytes())?;
        self.entries = kept.into_iter().collect();

        if report.duplicates > 0 || report.malformed > 0 {
            warn!(
                path = %self.path.display(),
                duplicates = report.duplicates,
                malformed = report.malformed,
                "Manifest repaired"
            );
        } else {
            info!(path = %self.path.display(), entries = report.kept, "Manifest rewritten");
        }

        Ok(report)
    }
}

/// Audit log of rename-on-copy decisions, `<original> <new>` per line.
#[derive(Debug)]
pub struct RenameLog {
    path: PathBuf,
    originals: HashSet<String>,
}

impl RenameLog {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let originals = read_lines(&path)?
            .into_iter()
            .filter(|(_, terminated)| *terminated)
            .filter_map(|(line, _)| {
                line.split_once(' ')
                    .map(|(original, _)| unescape_field(original))
                    .filter(|original| !original.is_empty())
            })
            .collect();

        Ok(Self { path, originals })
    }

    pub fn contains_original(&self, original: &str) -> bool {
        self.originals.contains(original)
    }

    pub fn originals(&self) -> &HashSet<String> {
        &self.originals
    }

    /// Whether `record` would accept this pair.
    pub fn check(original: &str, renamed: &str) -> Result<()> {
        for field in [original, renamed] {
            if !is_valid_identity(field) {
                return Err(SyncError::InvalidIdentity(field.to_string()));
            }
        }
        Ok(())
    }

    /// Append `<original> <new>`; spaces and backslashes inside either
    /// field are backslash-escaped.
    pub fn record(&mut self, original: &str, renamed: &str) -> Result<()> {
        Self::check(original, renamed)?;

        let line = format!("{} {}", escape_field(original), escape_field(renamed));
        append_line(&self.path, &line)?;
        self.originals.insert(original.to_string());
        Ok(())
    }
}

fn escape_field(field: &str) -> String {
    field.replace('\\', "\\\\").replace(' ', "\\s")
}

fn unescape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn is_valid_identity(identity: &str) -> bool {
    !identity.trim().is_empty() && !identity.chars().any(char::is_control)
}

/// Read all lines, flagging whether each was newline-terminated.
fn read_lines(path: &Path) -> Result<Vec<(String, bool)>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SyncError::Manifest {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let text = String::from_utf8_lossy(&bytes);
    let terminated = text.ends_with('\n');
    let mut lines: Vec<(String, bool)> = text
        .split('\n')
        .map(|line| (line.strip_suffix('\r').unwrap_or(line).to_string(), true))
        .collect();

    // split() yields a trailing "" after the final newline
    if terminated {
        lines.pop();
    } else if let Some(last) = lines.last_mut() {
        last.1 = false;
    }

    Ok(lines)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let wrap = |source| SyncError::Manifest {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)?;
    file.write_all(format!("{}\n", line).as_bytes()).map_err(wrap)?;
    file.sync_data().map_err(wrap)
}

fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let wrap = |source| SyncError::Manifest {
        path: path.to_path_buf(),
        source,
    };

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(wrap)?;
        file.write_all(content).map_err(wrap)?;
        file.sync_all().map_err(wrap)?;
    }
    fs::rename(&tmp, path).map_err(wrap)
}
