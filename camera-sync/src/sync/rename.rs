//! Rename-on-copy policy.
//!
//! A template such as `%Y%m%d-%H%M%S` is expanded from the image's
//! modification time. Supported tokens:
//!
//! | Token | Meaning                   |
//! |-------|---------------------------|
//! | `%Y`  | four-digit year           |
//! | `%m`  | month, `01`-`12`          |
//! | `%d`  | day of month, `01`-`31`   |
//! | `%H`  | hour, `00`-`23`           |
//! | `%M`  | minute                    |
//! | `%S`  | second                    |
//! | `%n`  | original file stem        |
//! | `%%`  | literal `%`               |
//!
//! The original extension is always kept.

use crate::utils::errors::{Result, SyncError};
use chrono::{DateTime, Datelike, Local, Timelike};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameTemplate {
    pattern: String,
}

/// Result of applying the rename policy to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOutcome {
    /// A free, template-derived name was found
    Renamed(PathBuf),
    /// Every candidate was taken; the file keeps its original name
    CapExceeded(PathBuf),
}

impl RenameTemplate {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(SyncError::Template("template is empty".into()));
        }
        if pattern.contains('/') || pattern.contains('\\') {
            return Err(SyncError::Template(format!(
                "'{}' must not contain path separators",
                pattern
            )));
        }

        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            if c == '%' {
                match chars.next() {
                    Some('Y' | 'm' | 'd' | 'H' | 'M' | 'S' | 'n' | '%') => {}
                    Some(other) => {
                        return Err(SyncError::Template(format!("unknown token '%{}'", other)))
                    }
                    None => return Err(SyncError::Template("dangling '%'".into())),
                }
            }
        }

        Ok(Self { pattern })
    }

    /// Expand the template into a file stem.
    pub fn expand(&self, modified: &DateTime<Local>, original_stem: &str) -> String {
        let mut out = String::with_capacity(self.pattern.len() + original_stem.len());
        let mut chars = self.pattern.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('Y') => out.push_str(&format!("{:04}", modified.year())),
                Some('m') => out.push_str(&format!("{:02}", modified.month())),
                Some('d') => out.push_str(&format!("{:02}", modified.day())),
                Some('H') => out.push_str(&format!("{:02}", modified.hour())),
                Some('M') => out.push_str(&format!("{:02}", modified.minute())),
                Some('S') => out.push_str(&format!("{:02}", modified.second())),
                Some('n') => out.push_str(original_stem),
                Some('%') => out.push('%'),
                // rejected in new()
                _ => {}
            }
        }

        out
    }

    /// Work out the renamed destination for a file that would otherwise land at
    /// `destination`.
    pub fn apply(
        &self,
        destination: &Path,
        modified: &DateTime<Local>,
        max_attempts: u32,
    ) -> RenameOutcome {
        let dir = destination.parent().unwrap_or_else(|| Path::new(""));
        let original_stem = destination
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = destination
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let stem = self.expand(modified, &original_stem);
        match free_name(dir, &stem, &extension, max_attempts) {
            Some(path) => RenameOutcome::Renamed(path),
            None => RenameOutcome::CapExceeded(destination.to_path_buf()),
        }
    }
}

/// Find `<stem><ext>` or the first free `<stem>-<k><ext>` in `dir`, trying at
/// most `max_attempts` numbered suffixes.
pub fn free_name(dir: &Path, stem: &str, extension: &str, max_attempts: u32) -> Option<PathBuf> {
    let candidate = dir.join(format!("{}{}", stem, extension));
    if !candidate.exists() {
        return Some(candidate);
    }

    (1..=max_attempts)
        .map(|k| dir.join(format!("{}-{}{}", stem, k, extension)))
        .find(|candidate| !candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn taken_at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap()
    }

    #[test]
    fn test_expand_all_tokens() {
        let template = RenameTemplate::new("%Y-%m-%d_%H%M%S_%n_100%%").unwrap();
        assert_eq!(
            template.expand(&taken_at(), "IMG_0042"),
            "2024-03-09_070502_IMG_0042_100%"
        );
    }

    #[test]
    fn test_invalid_templates() {
        assert!(RenameTemplate::new("").is_err());
        assert!(RenameTemplate::new("%Y/%m").is_err());
        assert!(RenameTemplate::new("%Q").is_err());
        assert!(RenameTemplate::new("abc%").is_err());
    }

    #[test]
    fn test_collision_suffixes() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("IMG_0001.JPG"), b"first")?;

        let template = RenameTemplate::new("%n").unwrap();
        let destination = dir.path().join("IMG_0001.JPG");

        let second = template.apply(&destination, &taken_at(), 1000);
        assert_eq!(second, RenameOutcome::Renamed(dir.path().join("IMG_0001-1.JPG")));
        fs::write(dir.path().join("IMG_0001-1.JPG"), b"second")?;

        let third = template.apply(&destination, &taken_at(), 1000);
        assert_eq!(third, RenameOutcome::Renamed(dir.path().join("IMG_0001-2.JPG")));
        Ok(())
    }

    #[test]
    fn test_cap_exceeded_keeps_original_name() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("20240309-070502.JPG"), b"")?;
        fs::write(dir.path().join("20240309-070502-1.JPG"), b"")?;
        fs::write(dir.path().join("20240309-070502-2.JPG"), b"")?;

        let template = RenameTemplate::new("%Y%m%d-%H%M%S").unwrap();
        let destination = dir.path().join("IMG_0001.JPG");

        let outcome = template.apply(&destination, &taken_at(), 2);
        assert_eq!(outcome, RenameOutcome::CapExceeded(destination));
        Ok(())
    }

    #[test]
    fn test_free_name_without_extension() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(free_name(dir.path(), "clip", "", 3), Some(dir.path().join("clip")));
        Ok(())
    }
}
