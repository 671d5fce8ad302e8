//! File timestamp handling.
//!
//! Copies off the camera keep the image's modification time so that rename
//! templates and later uploads see the capture time, not the copy time.

use chrono::{DateTime, Local};
use filetime::FileTime;
use std::path::Path;
use std::time::SystemTime;

pub fn to_local(time: SystemTime) -> DateTime<Local> {
    DateTime::<Local>::from(time)
}

/// Modification time of `path` in the local zone.
pub fn modified_local(path: &Path) -> std::io::Result<DateTime<Local>> {
    Ok(to_local(std::fs::metadata(path)?.modified()?))
}

/// Set a file's modification (and access) time.
pub fn preserve_modified(path: &Path, modified: &DateTime<Local>) -> std::io::Result<()> {
    let time = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
    filetime::set_file_times(path, time, time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_preserve_modified() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let taken = Local.with_ymd_and_hms(2023, 11, 4, 18, 30, 0).unwrap();

        preserve_modified(temp_file.path(), &taken)?;
        assert_eq!(modified_local(temp_file.path())?, taken);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(modified_local(Path::new("/nonexistent/IMG_0001.JPG")).is_err());
    }
}
