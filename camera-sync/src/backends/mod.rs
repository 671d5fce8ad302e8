//! Transfer backends.
//!
//! One implementation per transport. A backend is built once per job from
//! the job's configuration snapshot and driven sequentially by the
//! orchestrator: `connect`, then `put` per item (or one `put_batch`), then
//! `close`.

pub mod dropbox;
pub mod ftp;
pub mod gdrive;
pub mod local;
pub mod oauth;
pub mod rsync;
pub mod sftp;

use crate::config::{TransferConfig, TransferMethod};
use crate::sync::TransferItem;
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub use dropbox::DropboxBackend;
pub use ftp::FtpBackend;
pub use gdrive::GoogleDriveBackend;
pub use local::LocalCopyBackend;
pub use rsync::RsyncBackend;
pub use sftp::SftpBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    LocalCopy,
    Ftp,
    Sftp,
    Dropbox,
    GoogleDrive,
    Rsync,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::LocalCopy => "local copy",
            BackendKind::Ftp => "FTP",
            BackendKind::Sftp => "SFTP",
            BackendKind::Dropbox => "Dropbox",
            BackendKind::GoogleDrive => "Google Drive",
            BackendKind::Rsync => "rsync",
        };
        f.write_str(name)
    }
}

/// How a transport wants to be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One `put` per item
    PerItem,
    /// A single `put_batch` for the whole delta
    Batch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Worth retrying: timeouts, resets, throttling
    #[error("{backend}: {message}")]
    Transient { backend: BackendKind, message: String },

    /// Not worth retrying; aborts the job
    #[error("{backend}: {message}")]
    Permanent { backend: BackendKind, message: String },

    /// Stored credential missing or rejected
    #[error("{backend}: {message}. Re-authorize the account and try again")]
    Credential { backend: BackendKind, message: String },

    /// The local source of one item could not be read; only that item fails
    #[error("cannot read {path}: {message}")]
    SourceUnreadable { path: String, message: String },

    #[error("insufficient disk space: {available} bytes free, {needed} needed plus {floor} reserved")]
    DiskFloor { available: u64, needed: u64, floor: u64 },
}

impl TransferError {
    pub fn transient(backend: BackendKind, message: impl Into<String>) -> Self {
        TransferError::Transient {
            backend,
            message: message.into(),
        }
    }

    pub fn permanent(backend: BackendKind, message: impl Into<String>) -> Self {
        TransferError::Permanent {
            backend,
            message: message.into(),
        }
    }

    pub fn credential(backend: BackendKind, message: impl Into<String>) -> Self {
        TransferError::Credential {
            backend,
            message: message.into(),
        }
    }

    pub fn source_unreadable(path: impl Into<String>, err: &std::io::Error) -> Self {
        TransferError::SourceUnreadable {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }

    /// Counted as a failed item while the job carries on.
    pub fn skips_item(&self) -> bool {
        matches!(
            self,
            TransferError::Transient { .. } | TransferError::SourceUnreadable { .. }
        )
    }

    /// Classify a local I/O failure.
    pub fn from_io(backend: BackendKind, context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let message = format!("{}: {}", context, err);
        match err.kind() {
            TimedOut | Interrupted | WouldBlock | ConnectionReset | ConnectionAborted
            | BrokenPipe | UnexpectedEof => TransferError::Transient { backend, message },
            _ => TransferError::Permanent { backend, message },
        }
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;

#[async_trait]
pub trait TransferBackend: Send {
    fn kind(&self) -> BackendKind;

    fn mode(&self) -> TransferMode {
        TransferMode::PerItem
    }

    async fn connect(&mut self) -> TransferResult<()>;

    /// Transfer one item to `destination`, whole or not at all.
    async fn put(&mut self, _item: &TransferItem, _destination: &str) -> TransferResult<()> {
        Err(TransferError::permanent(
            self.kind(),
            "per-item transfers are not supported",
        ))
    }

    /// Transfer all `items` below `root` in one pass; returns the identities
    /// that were confirmed transferred.
    async fn put_batch(&mut self, _root: &Path, _items: &[TransferItem]) -> TransferResult<Vec<String>> {
        Err(TransferError::permanent(
            self.kind(),
            "batch transfers are not supported",
        ))
    }

    async fn close(&mut self);
}

/// Build the upload backend selected by `config.method`.
pub fn build_backend(config: &TransferConfig) -> Result<Box<dyn TransferBackend>> {
    let backend: Box<dyn TransferBackend> = match config.method {
        TransferMethod::Off => {
            return Err(SyncError::Config("no transfer method configured".into()))
        }
        TransferMethod::Ftp => {
            require("transfer.ftp.server", &config.ftp.server)?;
            Box::new(FtpBackend::new(config.ftp.clone()))
        }
        TransferMethod::Sftp => {
            require("transfer.sftp.server", &config.sftp.server)?;
            Box::new(SftpBackend::new(config.sftp.clone()))
        }
        TransferMethod::Dropbox => {
            require("transfer.dropbox.app_key", &config.dropbox.app_key)?;
            Box::new(DropboxBackend::new(config.dropbox.clone()))
        }
        TransferMethod::GoogleDrive => {
            require("transfer.google_drive.client_id", &config.google_drive.client_id)?;
            Box::new(GoogleDriveBackend::new(config.google_drive.clone()))
        }
        TransferMethod::Rsync => {
            require("transfer.rsync.host", &config.rsync.host)?;
            Box::new(RsyncBackend::new(config.rsync.clone()))
        }
    };
    Ok(backend)
}

fn require(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SyncError::Config(format!("{} is not set", key)));
    }
    Ok(())
}

/// Serve `router` on an ephemeral local port and return its base URL.
#[cfg(test)]
pub(crate) async fn serve_mock(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_backend_requires_method() {
        let config = TransferConfig::default();
        assert!(matches!(build_backend(&config), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_build_backend_requires_server() {
        let mut config = TransferConfig::default();
        config.method = TransferMethod::Ftp;
        assert!(build_backend(&config).is_err());

        config.ftp.server = "ftp.example.com".into();
        let backend = build_backend(&config).unwrap();
        assert_eq!(backend.kind(), BackendKind::Ftp);
        assert_eq!(backend.mode(), TransferMode::PerItem);
    }

    #[test]
    fn test_rsync_is_batch() {
        let mut config = TransferConfig::default();
        config.method = TransferMethod::Rsync;
        config.rsync.host = "backup.example.com".into();
        assert_eq!(build_backend(&config).unwrap().mode(), TransferMode::Batch);
    }

    #[test]
    fn test_io_classification() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(TransferError::from_io(BackendKind::Ftp, "put", &reset).is_transient());

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!TransferError::from_io(BackendKind::Ftp, "put", &denied).is_transient());
    }

    #[test]
    fn test_unreadable_source_skips_only_the_item() {
        let gone = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err = TransferError::source_unreadable("/home/pi/photos/a.jpg", &gone);
        assert!(err.skips_item());
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("cannot read /home/pi/photos/a.jpg"));

        assert!(!TransferError::permanent(BackendKind::Sftp, "quota exceeded").skips_item());
    }

    #[test]
    fn test_credential_message_names_backend() {
        let err = TransferError::credential(BackendKind::Dropbox, "token file missing");
        assert_eq!(
            err.to_string(),
            "Dropbox: token file missing. Re-authorize the account and try again"
        );
    }
}
