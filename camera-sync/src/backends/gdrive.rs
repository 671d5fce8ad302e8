//! Google Drive upload over the Drive v3 REST API.
//!
//! Drive addresses folders by id, not path, so each path segment is looked up
//! by name under its parent (starting at `root`) and created when missing.
//! Resolved ids are cached for the rest of the job.

use super::oauth::{self, classify_reqwest, classify_status};
use super::{BackendKind, TransferBackend, TransferError, TransferResult};
use crate::config::GoogleDriveConfig;
use crate::sync::TransferItem;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

const KIND: BackendKind = BackendKind::GoogleDrive;
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const BOUNDARY: &str = "camera_sync_upload_boundary";

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

pub struct GoogleDriveBackend {
    config: GoogleDriveConfig,
    client: Option<reqwest::Client>,
    access_token: Option<String>,
    /// (parent id, folder name) → folder id
    folder_ids: HashMap<(String, String), String>,
}

impl GoogleDriveBackend {
    pub fn new(config: GoogleDriveConfig) -> Self {
        Self {
            config,
            client: None,
            access_token: None,
            folder_ids: HashMap::new(),
        }
    }

    fn session(&self) -> TransferResult<(&reqwest::Client, &str)> {
        match (&self.client, &self.access_token) {
            (Some(client), Some(token)) => Ok((client, token.as_str())),
            _ => Err(TransferError::permanent(KIND, "not connected")),
        }
    }

    /// First non-trashed child of `parent` called `name`.
    async fn find_child(&self, parent: &str, name: &str, folder: bool) -> TransferResult<Option<String>> {
        let (client, token) = self.session()?;
        let mut query = format!(
            "name='{}' and '{}' in parents and trashed=false",
            escape_query(name),
            escape_query(parent)
        );
        if folder {
            query.push_str(&format!(" and mimeType='{}'", FOLDER_MIME));
        }

        let response = client
            .get(format!("{}/drive/v3/files", self.config.api_base))
            .bearer_auth(token)
            .query(&[("q", query.as_str()), ("fields", "files(id,name)")])
            .send()
            .await
            .map_err(|e| classify_reqwest(KIND, e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| classify_reqwest(KIND, e))?;
        if !status.is_success() {
            return Err(classify_status(KIND, status, &body));
        }

        let list: FileList = serde_json::from_str(&body)
            .map_err(|e| TransferError::permanent(KIND, format!("unexpected file list: {}", e)))?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, parent: &str, name: &str) -> TransferResult<String> {
        let (client, token) = self.session()?;
        let response = client
            .post(format!("{}/drive/v3/files", self.config.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME, "parents": [parent] }))
            .send()
            .await
            .map_err(|e| classify_reqwest(KIND, e))?;

        parse_id(response).await
    }

    /// Resolve (creating as needed) the folder id for a `/`-separated path.
    async fn folder_id(&mut self, folder: &str) -> TransferResult<String> {
        let mut parent = "root".to_string();

        for name in folder.split('/').filter(|s| !s.is_empty()) {
            let key = (parent.clone(), name.to_string());
            if let Some(id) = self.folder_ids.get(&key) {
                parent = id.clone();
                continue;
            }

            let id = match self.find_child(&parent, name, true).await? {
                Some(id) => id,
                None => {
                    let id = self.create_folder(&parent, name).await?;
                    debug!(folder = %name, id = %id, "Created Drive folder");
                    id
                }
            };
            self.folder_ids.insert(key, id.clone());
            parent = id;
        }

        Ok(parent)
    }

    async fn create_file(&self, parent: &str, name: &str, data: Vec<u8>) -> TransferResult<()> {
        let (client, token) = self.session()?;
        let metadata = json!({ "name": name, "parents": [parent] }).to_string();

        let mut body = Vec::with_capacity(data.len() + metadata.len() + 256);
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n--{b}\r\nContent-Type: application/octet-stream\r\n\r\n",
                b = BOUNDARY,
                m = metadata
            )
            .as_bytes(),
        );
        body.extend_from_slice(&data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        let response = client
            .post(format!("{}/upload/drive/v3/files", self.config.api_base))
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| classify_reqwest(KIND, e))?;

        parse_id(response).await.map(|_| ())
    }

    async fn update_file(&self, id: &str, data: Vec<u8>) -> TransferResult<()> {
        let (client, token) = self.session()?;
        let response = client
            .patch(format!("{}/upload/drive/v3/files/{}", self.config.api_base, id))
            .bearer_auth(token)
            .query(&[("uploadType", "media"), ("fields", "id")])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| classify_reqwest(KIND, e))?;

        parse_id(response).await.map(|_| ())
    }
}

async fn parse_id(response: reqwest::Response) -> TransferResult<String> {
    let status = response.status();
    let body = response.text().await.map_err(|e| classify_reqwest(KIND, e))?;
    if !status.is_success() {
        return Err(classify_status(KIND, status, &body));
    }
    let file: DriveFile = serde_json::from_str(&body)
        .map_err(|e| TransferError::permanent(KIND, format!("unexpected response: {}", e)))?;
    Ok(file.id)
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl TransferBackend for GoogleDriveBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn connect(&mut self) -> TransferResult<()> {
        let client = oauth::http_client(KIND)?;
        let refresh_token = oauth::load_refresh_token(KIND, &self.config.token_file).await?;
        let access_token = oauth::exchange_refresh_token(
            &client,
            KIND,
            &self.config.token_url,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ],
        )
        .await?;

        self.client = Some(client);
        self.access_token = Some(access_token);
        info!("Connected to Google Drive");
        Ok(())
    }

    async fn put(&mut self, item: &TransferItem, destination: &str) -> TransferResult<()> {
        let (folder, name) = match destination.trim_start_matches('/').rsplit_once('/') {
            Some((folder, name)) => (folder.to_string(), name.to_string()),
            None => (String::new(), destination.trim_start_matches('/').to_string()),
        };

        let parent = self.folder_id(&folder).await?;
        let data = tokio::fs::read(&item.source_path).await.map_err(|e| {
            TransferError::source_unreadable(item.source_path.display().to_string(), &e)
        })?;

        // Drive allows duplicate names; replace the content instead
        match self.find_child(&parent, &name, false).await? {
            Some(id) => self.update_file(&id, data).await?,
            None => self.create_file(&parent, &name, data).await?,
        }

        debug!(path = %destination, "Uploaded to Google Drive");
        Ok(())
    }

    async fn close(&mut self) {
        self.access_token = None;
        self.client = None;
    }
}
