//! SFTP upload via `ssh2` (libssh2).

use super::{BackendKind, TransferBackend, TransferError, TransferResult};
use crate::config::SftpConfig;
use crate::sync::paths::split_remote;
use crate::sync::TransferItem;
use async_trait::async_trait;
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const KIND: BackendKind = BackendKind::Sftp;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_TIMEOUT_MS: u32 = 60_000;

// libssh2 session error codes worth retrying
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
// SFTP status codes
const SSH_FX_NO_CONNECTION: i32 = 6;
const SSH_FX_CONNECTION_LOST: i32 = 7;

struct Connection {
    session: Session,
    sftp: Sftp,
    current_dir: Option<String>,
}

pub struct SftpBackend {
    config: SftpConfig,
    connection: Option<Connection>,
}

impl SftpBackend {
    pub fn new(config: SftpConfig) -> Self {
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
        let connection = tokio::task::spawn_blocking(move || open(&config))
            .await
            .map_err(|e| TransferError::transient(KIND, format!("connect task failed: {}", e)))??;
        self.connection = Some(connection);
        Ok(())
    }
}

fn open(config: &SftpConfig) -> TransferResult<Connection> {
    let addr = (config.server.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| TransferError::transient(KIND, format!("resolve {}: {}", config.server, e)))?
        .next()
        .ok_or_else(|| TransferError::permanent(KIND, format!("no address for {}", config.server)))?;

    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| TransferError::from_io(KIND, &format!("connect {}", addr), &e))?;

    let mut session = Session::new().map_err(classify)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(SESSION_TIMEOUT_MS);
    session.handshake().map_err(classify)?;
    session
        .userauth_password(&config.user, &config.password)
        .map_err(classify)?;
    if !session.authenticated() {
        return Err(TransferError::permanent(KIND, "authentication failed"));
    }

    let sftp = session.sftp().map_err(classify)?;
    Ok(Connection {
        session,
        sftp,
        current_dir: None,
    })
}

/// Create each missing segment of `dir`.
fn make_dirs(sftp: &Sftp, dir: &str) -> Result<(), ssh2::Error> {
    let mut current = if dir.starts_with('/') {
        String::from("/")
    } else {
        String::new()
    };

    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(segment);

        if sftp.stat(Path::new(&current)).is_err() {
            debug!(dir = %current, "Creating SFTP directory");
            sftp.mkdir(Path::new(&current), 0o755)?;
        }
    }
    Ok(())
}

fn upload(connection: &mut Connection, local: &Path, destination: &str) -> TransferResult<()> {
    let (dir, name) = split_remote(destination);

    if connection.current_dir.as_deref() != Some(dir) {
        make_dirs(&connection.sftp, dir).map_err(classify)?;
        connection.current_dir = Some(dir.to_string());
    }

    let target = Path::new(destination);
    let partial = Path::new(dir).join(format!("{}.part", name));

    let mut source = std::fs::File::open(local)
        .map_err(|e| TransferError::source_unreadable(local.display().to_string(), &e))?;
    {
        let mut remote = connection.sftp.create(&partial).map_err(classify)?;
        io::copy(&mut source, &mut remote)
            .map_err(|e| TransferError::from_io(KIND, destination, &e))?;
    }

    let flags = Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE);
    if connection.sftp.rename(&partial, target, flags).is_err() {
        // SFTPv3 servers refuse to rename over an existing file
        let _ = connection.sftp.unlink(target);
        connection
            .sftp
            .rename(&partial, target, None)
            .map_err(classify)?;
    }
    Ok(())
}

pub(crate) fn classify(err: ssh2::Error) -> TransferError {
    let message = err.message().to_string();
    match err.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_TIMEOUT
            | LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_SOCKET_RECV
            | LIBSSH2_ERROR_SOCKET_DISCONNECT,
        ) => TransferError::transient(KIND, message),
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => {
            TransferError::permanent(KIND, format!("authentication failed: {}", message))
        }
        ErrorCode::SFTP(SSH_FX_NO_CONNECTION | SSH_FX_CONNECTION_LOST) => {
            TransferError::transient(KIND, message)
        }
        _ => TransferError::permanent(KIND, message),
    }
}

#[async_trait]
impl TransferBackend for SftpBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&mut self) -> TransferResult<()> {
        self.ensure_connected().await?;
        info!(server = %self.config.server, port = self.config.port, "Connected to SFTP server");
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
                warn!(error = %err, "Dropping SFTP session after transient failure");
            }
            _ => self.connection = Some(connection),
        }
        result
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = connection.session.disconnect(None, "closing", None);
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), "timed out");
        assert!(classify(timeout).is_transient());

        let auth = ssh2::Error::new(
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            "bad password",
        );
        assert!(!classify(auth).is_transient());

        let lost = ssh2::Error::new(ErrorCode::SFTP(SSH_FX_CONNECTION_LOST), "lost");
        assert!(classify(lost).is_transient());

        // SSH_FX_PERMISSION_DENIED
        let denied = ssh2::Error::new(ErrorCode::SFTP(3), "denied");
        assert!(!classify(denied).is_transient());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut backend = SftpBackend::new(SftpConfig {
            server: "127.0.0.1".into(),
            port,
            ..SftpConfig::default()
        });
        assert!(backend.connect().await.unwrap_err().is_transient());
    }
}
