//! Configuration management for the sync agent.
//!
//! Loads configuration from a TOML file layered with `CAMERA_SYNC__*`
//! environment variable overrides (e.g. `CAMERA_SYNC__TRANSFER__METHOD=SFTP`).
//! Every field has a default, so a partial file is enough.

use crate::sync::paths::normalize_remote_folder;
use crate::utils::errors::{Result, SyncError};
use chrono::{Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CAMERA_SYNC";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub paths: PathsConfig,
    pub copy: CopyConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// HTTP port for job submission and polling
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Local store the camera is copied into, and the source of uploads
    pub photos_dir: PathBuf,

    /// Thumbnails and metadata sidecars derived from the local store
    pub thumbs_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

/// Camera → local store stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub day: ScheduleDay,
    pub hour: u32,

    /// Hour the controller wakes the Pi; a scheduled copy also runs then
    pub wake_hour: Option<u32>,

    /// Copy when invoked with `--bootup`
    pub copy_on_bootup: bool,

    /// Mount point of the camera's file store
    pub device_root: PathBuf,

    /// Command that wakes the camera before a claim attempt (argv form)
    pub wake_command: Vec<String>,

    pub claim_attempts: u32,
    pub claim_backoff_secs: u64,

    pub rename: bool,
    pub rename_template: String,
    pub rename_max_attempts: u32,

    pub delete_after_copy: bool,

    /// Free space that must remain on the local store after every copy
    pub reserved_free_bytes: u64,
}

/// Local store → remote destination stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub method: TransferMethod,
    pub day: ScheduleDay,
    pub hour: u32,
    pub delete_after_transfer: bool,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub ftp: FtpConfig,
    pub sftp: SftpConfig,
    pub dropbox: DropboxConfig,
    pub google_drive: GoogleDriveConfig,
    pub rsync: RsyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub remote_folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub remote_folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DropboxConfig {
    pub app_key: String,
    pub app_secret: String,

    /// JSON file holding the refresh token obtained out-of-band
    pub token_file: PathBuf,
    pub remote_folder: String,
    pub api_base: String,
    pub content_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleDriveConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_file: PathBuf,
    pub remote_folder: String,
    pub token_url: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsyncConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub remote_folder: String,
    pub ssh_key: Option<PathBuf>,

    /// rsync executable
    pub program: String,
}

/// Which remote backend the transfer stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferMethod {
    #[default]
    Off,
    #[serde(rename = "FTP")]
    Ftp,
    #[serde(rename = "SFTP")]
    Sftp,
    Dropbox,
    #[serde(rename = "Google Drive")]
    GoogleDrive,
    #[serde(rename = "rsync")]
    Rsync,
}

/// Day component of a transfer window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleDay {
    #[default]
    Off,
    Daily,
    On(Weekday),
}

impl ScheduleDay {
    pub fn includes(&self, day: Weekday) -> bool {
        match self {
            ScheduleDay::Off => false,
            ScheduleDay::Daily => true,
            ScheduleDay::On(d) => *d == day,
        }
    }
}

impl FromStr for ScheduleDay {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" | "Off" | "off" => Ok(ScheduleDay::Off),
            "Daily" | "daily" => Ok(ScheduleDay::Daily),
            other => other
                .parse::<Weekday>()
                .map(ScheduleDay::On)
                .map_err(|_| format!("unknown schedule day '{}'", other)),
        }
    }
}

impl TryFrom<String> for ScheduleDay {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleDay> for String {
    fn from(day: ScheduleDay) -> Self {
        day.to_string()
    }
}

impl fmt::Display for ScheduleDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleDay::Off => f.write_str("Off"),
            ScheduleDay::Daily => f.write_str("Daily"),
            ScheduleDay::On(day) => {
                let name = match day {
                    Weekday::Mon => "Monday",
                    Weekday::Tue => "Tuesday",
                    Weekday::Wed => "Wednesday",
                    Weekday::Thu => "Thursday",
                    Weekday::Fri => "Friday",
                    Weekday::Sat => "Saturday",
                    Weekday::Sun => "Sunday",
                };
                f.write_str(name)
            }
        }
    }
}

impl CopyConfig {
    /// A scheduled copy runs on a matching day at the copy hour or the wake hour.
    pub fn is_due<T: Datelike + Timelike>(&self, now: &T) -> bool {
        self.day.includes(now.weekday())
            && (now.hour() == self.hour || self.wake_hour == Some(now.hour()))
    }
}

impl TransferConfig {
    pub fn is_due<T: Datelike + Timelike>(&self, now: &T) -> bool {
        self.method != TransferMethod::Off
            && self.day.includes(now.weekday())
            && now.hour() == self.hour
    }

    /// Remote root folder of the selected method.
    pub fn remote_folder(&self) -> &str {
        match self.method {
            TransferMethod::Off => "",
            TransferMethod::Ftp => &self.ftp.remote_folder,
            TransferMethod::Sftp => &self.sftp.remote_folder,
            TransferMethod::Dropbox => &self.dropbox.remote_folder,
            TransferMethod::GoogleDrive => &self.google_drive.remote_folder,
            TransferMethod::Rsync => &self.rsync.remote_folder,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            photos_dir: PathBuf::from("/home/pi/photos"),
            thumbs_dir: PathBuf::from("/home/pi/thumbs"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            day: ScheduleDay::Off,
            hour: 0,
            wake_hour: None,
            copy_on_bootup: false,
            device_root: PathBuf::from("/media/camera"),
            wake_command: Vec::new(),
            claim_attempts: 6,
            claim_backoff_secs: 2,
            rename: false,
            rename_template: "%Y%m%d-%H%M%S".to_string(),
            rename_max_attempts: 1000,
            delete_after_copy: false,
            reserved_free_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            method: TransferMethod::Off,
            day: ScheduleDay::Off,
            hour: 0,
            delete_after_transfer: false,
            retry_attempts: 2,
            retry_delay_secs: 5,
            ftp: FtpConfig::default(),
            sftp: SftpConfig::default(),
            dropbox: DropboxConfig::default(),
            google_drive: GoogleDriveConfig::default(),
            rsync: RsyncConfig::default(),
        }
    }
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 21,
            user: String::new(),
            password: String::new(),
            remote_folder: String::new(),
        }
    }
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 22,
            user: String::new(),
            password: String::new(),
            remote_folder: String::new(),
        }
    }
}

impl Default for DropboxConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: String::new(),
            token_file: PathBuf::from("/home/pi/.dropbox-token.json"),
            remote_folder: String::new(),
            api_base: "https://api.dropboxapi.com".to_string(),
            content_base: "https://content.dropboxapi.com".to_string(),
        }
    }
}

impl Default for GoogleDriveConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_file: PathBuf::from("/home/pi/.gdrive-token.json"),
            remote_folder: String::new(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            api_base: "https://www.googleapis.com".to_string(),
        }
    }
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            remote_folder: String::new(),
            ssh_key: None,
            program: "rsync".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.normalized()
    }

    /// Parse configuration from a TOML string (no environment layering).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.normalized()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn normalized(mut self) -> Result<Self> {
        if self.copy.hour > 23 || self.transfer.hour > 23 {
            return Err(SyncError::Config("hours must be between 0 and 23".into()));
        }
        if self.copy.rename_max_attempts == 0 {
            return Err(SyncError::Config(
                "copy.rename_max_attempts must be at least 1".into(),
            ));
        }
        if self.transfer.retry_attempts == 0 {
            self.transfer.retry_attempts = 1;
        }

        let t = &mut self.transfer;
        t.ftp.remote_folder = normalize_remote_folder(&t.ftp.remote_folder);
        t.sftp.remote_folder = normalize_remote_folder(&t.sftp.remote_folder);
        t.dropbox.remote_folder = normalize_remote_folder(&t.dropbox.remote_folder);
        t.google_drive.remote_folder = normalize_remote_folder(&t.google_drive.remote_folder);
        t.rsync.remote_folder = normalize_remote_folder(&t.rsync.remote_folder);

        Ok(self)
    }
}
