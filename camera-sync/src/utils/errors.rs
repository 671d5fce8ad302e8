//! Custom error types for the sync agent.

use crate::executor::JobKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error ({}): {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid rename template: {0}")]
    Template(String),

    #[error("A {0} job is already running")]
    AlreadyRunning(JobKind),

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
