//! rsync-over-SSH.
//!
//! The whole delta goes up in a single rsync pass fed through
//! `--files-from=-`. With `--out-format=%n` rsync prints one line per file it
//! transferred; only those lines count as confirmed.

use super::{BackendKind, TransferBackend, TransferError, TransferMode, TransferResult};
use crate::config::RsyncConfig;
use crate::sync::TransferItem;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

const KIND: BackendKind = BackendKind::Rsync;

/// rsync exit codes after which the output still lists what was sent:
/// 23 partial transfer, 24 source files vanished.
const COMPLETED_EXIT_CODES: [i32; 3] = [0, 23, 24];
const SSH_FAILURE_EXIT_CODE: i32 = 255;

pub struct RsyncBackend {
    config: RsyncConfig,
}

impl RsyncBackend {
    pub fn new(config: RsyncConfig) -> Self {
        Self { config }
    }

    fn ssh_command(&self) -> String {
        let mut ssh = format!("ssh -p {}", self.config.port);
        if let Some(key) = &self.config.ssh_key {
            ssh.push_str(&format!(" -i {}", key.display()));
        }
        ssh.push_str(" -o BatchMode=yes -o ConnectTimeout=30");
        ssh
    }

    /// `user@host:path`
    fn remote_spec(&self, path: &str) -> String {
        let host = if self.config.user.is_empty() {
            self.config.host.clone()
        } else {
            format!("{}@{}", self.config.user, self.config.host)
        };
        format!("{}:{}", host, path)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .arg("-a")
            .arg("-e")
            .arg(self.ssh_command())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Map a failed run onto the transfer error classes.
fn classify_exit(code: Option<i32>, stderr: &str) -> TransferError {
    let detail = stderr.lines().last().unwrap_or("").trim();
    let message = match code {
        Some(code) => format!("rsync exited with {}: {}", code, detail),
        None => format!("rsync terminated by signal: {}", detail),
    };

    if code == Some(SSH_FAILURE_EXIT_CODE) && stderr.contains("Permission denied") {
        TransferError::permanent(KIND, message)
    } else {
        TransferError::transient(KIND, message)
    }
}

/// Names rsync reported, restricted to files in the submitted list.
fn confirmed<'a>(stdout: &str, submitted: &HashMap<String, &'a str>) -> Vec<&'a str> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with('/'))
        .filter_map(|line| submitted.get(line).copied())
        .collect()
}

#[async_trait]
impl TransferBackend for RsyncBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn mode(&self) -> TransferMode {
        TransferMode::Batch
    }

    async fn connect(&mut self) -> TransferResult<()> {
        // Connection is made per rsync run
        Ok(())
    }

    async fn put_batch(&mut self, root: &Path, items: &[TransferItem]) -> TransferResult<Vec<String>> {
        let mut submitted: HashMap<String, &str> = HashMap::with_capacity(items.len());
        let mut list = String::new();
        for item in items {
            match item.source_path.strip_prefix(root) {
                Ok(relative) => {
                    let relative = relative.to_string_lossy().into_owned();
                    list.push_str(&relative);
                    list.push('\n');
                    submitted.insert(relative, item.identity.as_str());
                }
                Err(_) => warn!(path = %item.source_path.display(), "Not below the photo store, skipped"),
            }
        }
        if submitted.is_empty() {
            return Ok(Vec::new());
        }

        let remote = match self.config.remote_folder.trim_end_matches('/') {
            "" => String::new(),
            folder => format!("{}/", folder),
        };

        info!(files = submitted.len(), host = %self.config.host, "Starting rsync pass");
        let mut child = self
            .command()
            .arg("--out-format=%n")
            .arg("--files-from=-")
            .arg(format!("{}/", root.display()))
            .arg(self.remote_spec(&remote))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| TransferError::permanent(KIND, format!("cannot run {}: {}", self.config.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(list.as_bytes()).await {
                // rsync exited early; its status says why
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(TransferError::from_io(KIND, "write file list", &e)),
                Ok(()) => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TransferError::from_io(KIND, "wait for rsync", &e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let code = output.status.code();
        if !code.is_some_and(|c| COMPLETED_EXIT_CODES.contains(&c)) {
            return Err(classify_exit(code, &stderr));
        }
        if code != Some(0) {
            warn!(code = ?code, stderr = %stderr.trim(), "rsync pass completed with errors");
        }

        let sent: Vec<String> = confirmed(&stdout, &submitted)
            .into_iter()
            .map(str::to_string)
            .collect();
        debug!(sent = sent.len(), submitted = submitted.len(), "rsync pass finished");
        Ok(sent)
    }

    async fn close(&mut self) {}
}
