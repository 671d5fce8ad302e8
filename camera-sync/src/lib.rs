//! Camera Sync Library
//!
//! Incremental camera-to-disk copy and multi-destination upload engine for
//! time-lapse rigs. Files are tracked in plain-text manifests so repeated runs
//! only move what has not been handled yet.

pub mod api;
pub mod backends;
pub mod config;
pub mod daemon;
pub mod device;
pub mod executor;
pub mod fs;
pub mod scheduler;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
