//! FTP upload via `suppaftp`.
//!
//! The client is blocking, so every exchange runs on the blocking pool with
//! the control connection moved in and handed back afterwards. A transient
//! failure drops the connection and the next `put` reconnects.

use super::{BackendKind, TransferBackend, TransferError, TransferResult};
use crate::config::FtpConfig;
use crate::sync::paths::split_remote;
use crate::sync::TransferItem;
use async_trait::async_trait;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info, warn};

const KIND: BackendKind = BackendKind::Ftp;
const IO_TIMEOUT: Duration = Duration::from_secs(60);

struct Connection {
    stream: FtpStream,
    /// Working directory right after login; relative paths start here
    home: String,
    /// Remote working directory after the last upload
    current_dir: Option<String>,
}

pub struct FtpBackend {
    config: FtpConfig,
    connection: Option<Connection>,
}

impl FtpBackend {
    pub fn new(config: FtpConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    async fn ensure_connected(&mut self) -> TransferResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let config = self.config.clone();
        let (stream, home) = tokio::task::spawn_blocking(move || open(&config))
            .await
            .map_err(|e| TransferError::transient(KIND, format!("connect task failed: {}", e)))??;

        debug!(home = %home, "FTP login directory");
        self.connection = Some(Connection {
            stream,
            home,
            current_dir: None,
        });
        Ok(())
    }
}

fn open(config: &FtpConfig) -> TransferResult<(FtpStream, String)> {
    let addr = (config.server.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| TransferError::transient(KIND, format!("resolve {}: {}", config.server, e)))?
        .next()
        .ok_or_else(|| TransferError::permanent(KIND, format!("no address for {}", config.server)))?;

    let mut stream = FtpStream::connect_timeout(addr, IO_TIMEOUT).map_err(classify)?;
    stream
        .get_ref()
        .set_read_timeout(Some(IO_TIMEOUT))
        .map_err(|e| TransferError::from_io(KIND, "set timeout", &e))?;

    stream
        .login(&config.user, &config.password)
        .map_err(|e| match classify(e) {
            TransferError::Permanent { message, .. } => {
                TransferError::permanent(KIND, format!("login failed: {}", message))
            }
            other => other,
        })?;
    stream.transfer_type(FileType::Binary).map_err(classify)?;
    let home = stream.pwd().map_err(classify)?;
    Ok((stream, home))
}

/// Change into `dir`, creating missing segments. A relative `dir` is
/// resolved from the login directory `home`, not from wherever the previous
/// upload left the session.
fn enter_dir(stream: &mut FtpStream, home: &str, dir: &str) -> Result<(), FtpError> {
    stream.cwd(if dir.starts_with('/') { "/" } else { home })?;
    if dir.is_empty() || stream.cwd(dir).is_ok() {
        return Ok(());
    }

    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if stream.cwd(segment).is_err() {
            debug!(segment = %segment, "Creating FTP directory");
            stream.mkdir(segment)?;
            stream.cwd(segment)?;
        }
    }
    Ok(())
}

fn upload(connection: &mut Connection, local: &Path, destination: &str) -> TransferResult<()> {
    let (dir, name) = split_remote(destination);

    if connection.current_dir.as_deref() != Some(dir) {
        connection.current_dir = None;
        enter_dir(&mut connection.stream, &connection.home, dir).map_err(classify)?;
        connection.current_dir = Some(dir.to_string());
    }

    let mut file = std::fs::File::open(local)
        .map_err(|e| TransferError::source_unreadable(local.display().to_string(), &e))?;

    // Upload under a temporary name so an interrupted STOR never leaves a
    // truncated file under the real one
    let partial = format!("{}.part", name);
    connection
        .stream
        .put_file(partial.as_str(), &mut file)
        .map_err(classify)?;
    if connection.stream.rename(partial.as_str(), name).is_err() {
        let _ = connection.stream.rm(name);
        connection
            .stream
            .rename(partial.as_str(), name)
            .map_err(classify)?;
    }
    Ok(())
}

pub(crate) fn classify(err: FtpError) -> TransferError {
    match err {
        FtpError::ConnectionError(e) => TransferError::transient(KIND, e.to_string()),
        FtpError::UnexpectedResponse(ref response) => {
            let code = response.status.code();
            let message = format!(
                "{} {}",
                code,
                String::from_utf8_lossy(&response.body).trim()
            );
            if (400..500).contains(&code) {
                TransferError::transient(KIND, message)
            } else {
                TransferError::permanent(KIND, message)
            }
        }
        other => TransferError::permanent(KIND, other.to_string()),
    }
}

#[async_trait]
impl TransferBackend for FtpBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&mut self) -> TransferResult<()> {
        self.ensure_connected().await?;
        info!(server = %self.config.server, port = self.config.port, "Connected to FTP server");
        Ok(())
    }

    async fn put(&mut self, item: &TransferItem, destination: &str) -> TransferResult<()> {
        self.ensure_connected().await?;
        let mut connection = self
            .connection
            .take()
            .ok_or_else(|| TransferError::transient(KIND, "not connected"))?;

        let local = item.source_path.clone();
        let destination = destination.to_string();
        let (connection, result) = tokio::task::spawn_blocking(move || {
            let result = upload(&mut connection, &local, &destination);
            (connection, result)
        })
        .await
        .map_err(|e| TransferError::transient(KIND, format!("upload task failed: {}", e)))?;

        match &result {
            Err(err) if err.is_transient() => {
                warn!(error = %err, "Dropping FTP connection after transient failure");
            }
            _ => self.connection = Some(connection),
        }
        result
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = tokio::task::spawn_blocking(move || connection.stream.quit()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::collections::HashSet;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// What the in-memory FTP server saw and stored.
    struct FakeFtp {
        dirs: HashSet<String>,
        files: Vec<String>,
        commands: Vec<String>,
    }

    fn resolve(cwd: &str, arg: &str) -> String {
        let mut parts: Vec<&str> = if arg.starts_with('/') {
            Vec::new()
        } else {
            cwd.split('/').filter(|s| !s.is_empty()).collect()
        };
        parts.extend(arg.split('/').filter(|s| !s.is_empty()));
        format!("/{}", parts.join("/"))
    }

    /// Single-session server with a login directory of `/home/pi`,
    /// passive-mode STOR, RNFR/RNTO, CWD and MKD.
    fn recording_server() -> (u16, Arc<Mutex<FakeFtp>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(FakeFtp {
            dirs: ["/", "/home", "/home/pi"].iter().map(|d| d.to_string()).collect(),
            files: Vec::new(),
            commands: Vec::new(),
        }));

        let shared = state.clone();
        std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut writer = socket.try_clone().unwrap();
            let mut reader = BufReader::new(socket);
            let mut cwd = "/home/pi".to_string();
            let mut data: Option<TcpListener> = None;
            let mut rename_from: Option<String> = None;
            writer.write_all(b"220 ready\r\n").unwrap();

            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let command = line.trim_end().to_string();
                line.clear();
                let (verb, arg) = command.split_once(' ').unwrap_or((command.as_str(), ""));
                shared.lock().unwrap().commands.push(command.clone());

                let reply = match verb {
                    "USER" => "331 password required".to_string(),
                    "PASS" => "230 logged in".to_string(),
                    "TYPE" => "200 type set".to_string(),
                    "PWD" => format!("257 \"{}\" is the current directory", cwd),
                    "CWD" => {
                        let target = resolve(&cwd, arg);
                        if shared.lock().unwrap().dirs.contains(&target) {
                            cwd = target;
                            "250 directory changed".to_string()
                        } else {
                            "550 no such directory".to_string()
                        }
                    }
                    "MKD" => {
                        let target = resolve(&cwd, arg);
                        shared.lock().unwrap().dirs.insert(target.clone());
                        format!("257 \"{}\" created", target)
                    }
                    "PASV" => {
                        let passive = TcpListener::bind("127.0.0.1:0").unwrap();
                        let p = passive.local_addr().unwrap().port();
                        data = Some(passive);
                        format!("227 Entering Passive Mode (127,0,0,1,{},{})", p / 256, p % 256)
                    }
                    "STOR" => {
                        writer.write_all(b"150 ok to send data\r\n").unwrap();
                        let (mut upload, _) = data.take().unwrap().accept().unwrap();
                        std::io::copy(&mut upload, &mut std::io::sink()).unwrap();
                        shared.lock().unwrap().files.push(resolve(&cwd, arg));
                        "226 transfer complete".to_string()
                    }
                    "RNFR" => {
                        rename_from = Some(resolve(&cwd, arg));
                        "350 ready for destination".to_string()
                    }
                    "RNTO" => {
                        let target = resolve(&cwd, arg);
                        let from = rename_from.take().unwrap_or_default();
                        let mut state = shared.lock().unwrap();
                        state.files.retain(|f| *f != from);
                        state.files.push(target);
                        "250 renamed".to_string()
                    }
                    "QUIT" => {
                        let _ = writer.write_all(b"221 bye\r\n");
                        break;
                    }
                    _ => "502 not implemented".to_string(),
                };
                if writer.write_all(format!("{}\r\n", reply).as_bytes()).is_err() {
                    break;
                }
            }
        });
        (port, state)
    }

    fn item(dir: &TempDir, name: &str) -> TransferItem {
        let path = dir.path().join(name);
        std::fs::write(&path, b"jpeg").unwrap();
        TransferItem {
            identity: path.to_string_lossy().into_owned(),
            source_path: path,
            size: 4,
            modified_at: Local::now(),
        }
    }

    fn changes_dir(command: &str) -> bool {
        command.starts_with("CWD") || command.starts_with("MKD")
    }

    #[tokio::test]
    async fn test_relative_folders_resolve_from_login_directory() {
        let (port, state) = recording_server();
        let sources = TempDir::new().unwrap();
        let mut backend = FtpBackend::new(FtpConfig {
            password: "secret".into(),
            remote_folder: "backup".into(),
            ..config(port)
        });
        backend.connect().await.unwrap();

        backend
            .put(&item(&sources, "a.jpg"), "backup/DCIM/100CANON/a.jpg")
            .await
            .unwrap();
        let after_first = state.lock().unwrap().commands.len();

        backend
            .put(&item(&sources, "c.jpg"), "backup/DCIM/100CANON/c.jpg")
            .await
            .unwrap();
        let after_second = state.lock().unwrap().commands.len();

        backend
            .put(&item(&sources, "b.jpg"), "backup/DCIM/101CANON/b.jpg")
            .await
            .unwrap();
        backend.close().await;

        let state = state.lock().unwrap();
        assert_eq!(
            state.files,
            vec![
                "/home/pi/backup/DCIM/100CANON/a.jpg",
                "/home/pi/backup/DCIM/100CANON/c.jpg",
                "/home/pi/backup/DCIM/101CANON/b.jpg",
            ]
        );

        // Same folder as the previous file: no directory round trips
        assert!(!state.commands[after_first..after_second].iter().any(|c| changes_dir(c)));

        let created: Vec<&str> = state
            .commands
            .iter()
            .filter_map(|c| c.strip_prefix("MKD "))
            .collect();
        assert_eq!(created, vec!["backup", "DCIM", "100CANON", "101CANON"]);
        assert!(state.dirs.contains("/home/pi/backup/DCIM/101CANON"));
    }

    #[tokio::test]
    async fn test_absolute_folder_starts_at_root() {
        let (port, state) = recording_server();
        let sources = TempDir::new().unwrap();
        let mut backend = FtpBackend::new(config(port));
        backend.connect().await.unwrap();

        backend
            .put(&item(&sources, "a.jpg"), "/DCIM/100CANON/a.jpg")
            .await
            .unwrap();
        backend.close().await;

        assert_eq!(state.lock().unwrap().files, vec!["/DCIM/100CANON/a.jpg"]);
    }

    /// Minimal server that greets, then rejects any login.
    fn rejecting_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut writer = socket.try_clone().unwrap();
            let mut reader = BufReader::new(socket);
            writer.write_all(b"220 ready\r\n").unwrap();

            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let reply: &[u8] = if line.starts_with("USER") {
                    b"331 password required\r\n"
                } else if line.starts_with("PASS") {
                    b"530 Login incorrect.\r\n"
                } else {
                    b"221 bye\r\n"
                };
                if writer.write_all(reply).is_err() {
                    break;
                }
                line.clear();
            }
        });
        port
    }

    fn config(port: u16) -> FtpConfig {
        FtpConfig {
            server: "127.0.0.1".into(),
            port,
            user: "pi".into(),
            password: "wrong".into(),
            remote_folder: String::new(),
        }
    }

    #[tokio::test]
    async fn test_login_rejection_is_permanent() {
        let port = rejecting_server();
        let mut backend = FtpBackend::new(config(port));

        let err = backend.connect().await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("login failed"), "{}", err);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut backend = FtpBackend::new(config(port));
        assert!(backend.connect().await.unwrap_err().is_transient());
    }

    #[test]
    fn test_connection_error_is_transient() {
        let err = FtpError::ConnectionError(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(classify(err).is_transient());
    }
}
