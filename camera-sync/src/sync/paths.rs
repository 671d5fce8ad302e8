//! Destination path resolution.
//!
//! Cameras store images below a `DCIM` folder (`/store_00010001/DCIM/100CANON/IMG_0001.JPG`).
//! Everything from that marker onwards is re-rooted under the destination, so
//! the camera's folder layout is preserved without the caller knowing it.

use std::path::{Component, Path, PathBuf};

/// Folder name that marks the start of the camera's media tree.
pub const MEDIA_ROOT_MARKER: &str = "DCIM";

/// Returns the path suffix starting at the media root marker, including the
/// file name. `None` if no parent folder is the marker.
pub fn media_suffix(source: &Path) -> Option<PathBuf> {
    let parent = source.parent()?;
    let components: Vec<Component<'_>> = parent.components().collect();
    let start = components
        .iter()
        .position(|c| c.as_os_str() == MEDIA_ROOT_MARKER)?;

    let mut suffix: PathBuf = components[start..].iter().collect();
    suffix.push(source.file_name()?);
    Some(suffix)
}

/// Resolve a local destination for `source` below `destination_root`,
/// creating intermediate directories.
pub fn local_destination(source: &Path, destination_root: &Path) -> std::io::Result<PathBuf> {
    let relative = match media_suffix(source) {
        Some(suffix) => suffix,
        None => PathBuf::from(source.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("source has no file name: {}", source.display()),
            )
        })?),
    };

    let destination = destination_root.join(relative);
    if let Some(dir) = destination.parent() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(destination)
}

/// Resolve a remote destination path string for `source` below `remote_root`.
///
/// An empty root places files at `/DCIM/...`, matching a login directory of `/`.
pub fn remote_destination(source: &Path, remote_root: &str) -> String {
    let relative = media_suffix(source)
        .or_else(|| source.file_name().map(PathBuf::from))
        .unwrap_or_default();

    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    format!("{}/{}", remote_root.trim_end_matches('/'), segments.join("/"))
}

/// Split a remote path into its directory and file name.
pub fn split_remote(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Convert backslashes to slashes and collapse repeated slashes.
pub fn normalize_remote_folder(folder: &str) -> String {
    let mut out = String::with_capacity(folder.len());
    for ch in folder.trim().chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_media_suffix_found() {
        let suffix = media_suffix(Path::new("/store_00010001/DCIM/100CANON/IMG_0001.JPG"));
        assert_eq!(suffix, Some(PathBuf::from("DCIM/100CANON/IMG_0001.JPG")));
    }

    #[test]
    fn test_media_suffix_missing() {
        assert_eq!(media_suffix(Path::new("/store_00010001/misc/IMG_0001.JPG")), None);
        // The marker must be a folder, not the file itself
        assert_eq!(media_suffix(Path::new("/store/DCIM")), None);
    }

    #[test]
    fn test_local_destination_creates_tree() -> std::io::Result<()> {
        let root = TempDir::new()?;
        let dest = local_destination(
            Path::new("/store_00010001/DCIM/100CANON/IMG_0001.JPG"),
            root.path(),
        )?;

        assert_eq!(dest, root.path().join("DCIM/100CANON/IMG_0001.JPG"));
        assert!(root.path().join("DCIM/100CANON").is_dir());
        Ok(())
    }

    #[test]
    fn test_local_destination_without_marker() -> std::io::Result<()> {
        let root = TempDir::new()?;
        let dest = local_destination(Path::new("/store/misc/clip.MOV"), root.path())?;
        assert_eq!(dest, root.path().join("clip.MOV"));
        Ok(())
    }

    #[test]
    fn test_remote_destination() {
        let src = Path::new("/home/pi/photos/DCIM/100CANON/IMG_0001.JPG");
        assert_eq!(remote_destination(src, ""), "/DCIM/100CANON/IMG_0001.JPG");
        assert_eq!(remote_destination(src, "/"), "/DCIM/100CANON/IMG_0001.JPG");
        assert_eq!(
            remote_destination(src, "/timelapse/site1/"),
            "/timelapse/site1/DCIM/100CANON/IMG_0001.JPG"
        );
        assert_eq!(
            remote_destination(Path::new("/home/pi/photos/a.jpg"), "backup"),
            "backup/a.jpg"
        );
    }

    #[test]
    fn test_split_remote() {
        assert_eq!(split_remote("/DCIM/100CANON/a.jpg"), ("/DCIM/100CANON", "a.jpg"));
        assert_eq!(split_remote("/a.jpg"), ("/", "a.jpg"));
        assert_eq!(split_remote("a.jpg"), ("", "a.jpg"));
    }

    #[test]
    fn test_normalize_remote_folder() {
        assert_eq!(normalize_remote_folder("\\photos\\site"), "/photos/site");
        assert_eq!(normalize_remote_folder("//photos///site//"), "/photos/site/");
        assert_eq!(normalize_remote_folder("  "), "");
    }
}
