//! Dropbox upload over the v2 HTTP API.

use super::oauth::{self, classify_reqwest, classify_status};
use super::{BackendKind, TransferBackend, TransferError, TransferResult};
use crate::config::DropboxConfig;
use crate::sync::paths::split_remote;
use crate::sync::TransferItem;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info};

const KIND: BackendKind = BackendKind::Dropbox;

pub struct DropboxBackend {
    config: DropboxConfig,
    client: Option<reqwest::Client>,
    access_token: Option<String>,
    /// Folders known to exist, for this job only
    folders: HashSet<String>,
}

impl DropboxBackend {
    pub fn new(config: DropboxConfig) -> Self {
        Self {
            config,
            client: None,
            access_token: None,
            folders: HashSet::new(),
        }
    }

    fn session(&self) -> TransferResult<(&reqwest::Client, &str)> {
        match (&self.client, &self.access_token) {
            (Some(client), Some(token)) => Ok((client, token.as_str())),
            _ => Err(TransferError::permanent(KIND, "not connected")),
        }
    }

    async fn ensure_folder(&mut self, folder: &str) -> TransferResult<()> {
        if folder.is_empty() || folder == "/" || self.folders.contains(folder) {
            return Ok(());
        }

        let (client, token) = self.session()?;
        let response = client
            .post(format!("{}/2/files/create_folder_v2", self.config.api_base))
            .bearer_auth(token)
            .json(&json!({ "path": folder, "autorename": false }))
            .send()
            .await
            .map_err(|e| classify_reqwest(KIND, e))?;

        let status = response.status();
        if status.is_success() {
            debug!(folder = %folder, "Created Dropbox folder");
        } else {
            let body = response.text().await.unwrap_or_default();
            let exists = status == StatusCode::CONFLICT && body.contains("path/conflict/folder");
            if !exists {
                return Err(classify_status(KIND, status, &body));
            }
        }

        // create_folder_v2 creates missing parents too
        let mut current = folder;
        loop {
            self.folders.insert(current.to_string());
            match split_remote(current) {
                ("/", _) | ("", _) => break,
                (parent, _) => current = parent,
            }
        }
        Ok(())
    }
}

/// `Dropbox-API-Arg` must be ASCII; escape everything else as `\uXXXX`.
fn api_arg(path: &str) -> String {
    let raw = json!({
        "path": path,
        "mode": "overwrite",
        "autorename": false,
        "mute": true,
    })
    .to_string();

    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut buf = [0u16; 2];
            for unit in ch.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

#[async_trait]
impl TransferBackend for DropboxBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&mut self) -> TransferResult<()> {
        let client = oauth::http_client(KIND)?;
        let refresh_token = oauth::load_refresh_token(KIND, &self.config.token_file).await?;
        let token_url = format!("{}/oauth2/token", self.config.api_base);
        let access_token = oauth::exchange_refresh_token(
            &client,
            KIND,
            &token_url,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.config.app_key.as_str()),
                ("client_secret", self.config.app_secret.as_str()),
            ],
        )
        .await?;

        self.client = Some(client);
        self.access_token = Some(access_token);
        info!("Connected to Dropbox");
        Ok(())
    }

    async fn put(&mut self, item: &TransferItem, destination: &str) -> TransferResult<()> {
        let destination = if destination.starts_with('/') {
            destination.to_string()
        } else {
            format!("/{}", destination)
        };
        let (folder, _) = split_remote(&destination);
        self.ensure_folder(folder).await?;

        let data = tokio::fs::read(&item.source_path).await.map_err(|e| {
            TransferError::source_unreadable(item.source_path.display().to_string(), &e)
        })?;

        let (client, token) = self.session()?;
        let response = client
            .post(format!("{}/2/files/upload", self.config.content_base))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", api_arg(&destination))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| classify_reqwest(KIND, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("insufficient_space") {
                return Err(TransferError::permanent(KIND, "Dropbox account is full"));
            }
            return Err(classify_status(KIND, status, &body));
        }

        debug!(path = %destination, "Uploaded to Dropbox");
        Ok(())
    }

    async fn close(&mut self) {
        self.access_token = None;
        self.client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::serve_mock;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Local;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Mock {
        folder_calls: AtomicUsize,
        uploads: Mutex<Vec<(String, usize)>>,
    }

    fn router(mock: Arc<Mock>) -> Router {
        Router::new()
            .route(
                "/oauth2/token",
                post(|body: String| async move {
                    if body.contains("refresh_token=good") {
                        (AxumStatus::OK, r#"{"access_token":"at-1","token_type":"bearer"}"#)
                    } else {
                        (AxumStatus::BAD_REQUEST, r#"{"error":"invalid_grant"}"#)
                    }
                }),
            )
            .route(
                "/2/files/create_folder_v2",
                post(
                    |State(mock): State<Arc<Mock>>, Json(body): Json<serde_json::Value>| async move {
                        mock.folder_calls.fetch_add(1, Ordering::SeqCst);
                        if body["path"] == "/backup/DCIM" {
                            (
                                AxumStatus::CONFLICT,
                                r#"{"error_summary":"path/conflict/folder/.."}"#.to_string(),
                            )
                        } else {
                            (AxumStatus::OK, "{}".to_string())
                        }
                    },
                ),
            )
            .route(
                "/2/files/upload",
                post(
                    |State(mock): State<Arc<Mock>>, headers: HeaderMap, body: axum::body::Bytes| async move {
                        if headers["authorization"] != "Bearer at-1" {
                            return AxumStatus::UNAUTHORIZED;
                        }
                        let arg: serde_json::Value =
                            serde_json::from_str(headers["dropbox-api-arg"].to_str().unwrap()).unwrap();
                        let path = arg["path"].as_str().unwrap().to_string();
                        mock.uploads.lock().unwrap().push((path, body.len()));
                        AxumStatus::OK
                    },
                ),
            )
            .with_state(mock)
    }

    fn config(base: &str, dir: &TempDir, token: &str) -> DropboxConfig {
        let token_file = dir.path().join("dropbox.json");
        std::fs::write(&token_file, format!(r#"{{"refresh_token":"{}"}}"#, token)).unwrap();
        DropboxConfig {
            app_key: "key".into(),
            app_secret: "secret".into(),
            token_file,
            remote_folder: "/backup".into(),
            api_base: base.to_string(),
            content_base: base.to_string(),
        }
    }

    fn item(dir: &TempDir, name: &str) -> TransferItem {
        let path = dir.path().join(name);
        std::fs::write(&path, b"image-bytes").unwrap();
        TransferItem {
            identity: path.to_string_lossy().into_owned(),
            source_path: PathBuf::from(&path),
            size: 11,
            modified_at: Local::now(),
        }
    }

    #[tokio::test]
    async fn test_upload_creates_folder_once() {
        let mock = Arc::new(Mock::default());
        let base = serve_mock(router(mock.clone())).await;
        let dir = TempDir::new().unwrap();

        let mut backend = DropboxBackend::new(config(&base, &dir, "good"));
        backend.connect().await.unwrap();

        let a = item(&dir, "a.jpg");
        let b = item(&dir, "b.jpg");
        backend.put(&a, "/backup/DCIM/100CANON/a.jpg").await.unwrap();
        backend.put(&b, "/backup/DCIM/100CANON/b.jpg").await.unwrap();
        // parent already cached from the first create
        backend.put(&b, "/backup/DCIM/b.jpg").await.unwrap();
        backend.close().await;

        assert_eq!(mock.folder_calls.load(Ordering::SeqCst), 1);
        let uploads = mock.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[0], ("/backup/DCIM/100CANON/a.jpg".to_string(), 11));
    }

    #[tokio::test]
    async fn test_existing_folder_conflict_is_ok() {
        let mock = Arc::new(Mock::default());
        let base = serve_mock(router(mock.clone())).await;
        let dir = TempDir::new().unwrap();

        let mut backend = DropboxBackend::new(config(&base, &dir, "good"));
        backend.connect().await.unwrap();
        backend.put(&item(&dir, "c.jpg"), "/backup/DCIM/c.jpg").await.unwrap();
        assert_eq!(mock.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_is_credential_error() {
        let mock = Arc::new(Mock::default());
        let base = serve_mock(router(mock)).await;
        let dir = TempDir::new().unwrap();

        let mut backend = DropboxBackend::new(config(&base, &dir, "revoked"));
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, TransferError::Credential { .. }));
        assert!(err.to_string().starts_with("Dropbox:"));
    }

    #[test]
    fn test_api_arg_escapes_non_ascii() {
        let arg = api_arg("/Fotos/Köln.jpg");
        assert!(arg.is_ascii());
        assert!(arg.contains("K\\u00f6ln.jpg"));
    }
}
