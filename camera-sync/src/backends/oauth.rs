//! Shared plumbing for the HTTP-based cloud backends: stored refresh
//! credentials, access-token exchange and status classification.

use super::{BackendKind, TransferError, TransferResult};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Refresh credential written by the out-of-band authorization step.
///
/// ```json
/// { "refresh_token": "..." }
/// ```
#[derive(Debug, Deserialize)]
pub struct StoredCredential {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub fn http_client(backend: BackendKind) -> TransferResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| TransferError::permanent(backend, format!("HTTP client: {}", e)))
}

/// Read the stored refresh token. Any problem is a credential error.
pub async fn load_refresh_token(backend: BackendKind, path: &Path) -> TransferResult<String> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        TransferError::credential(
            backend,
            format!("cannot read credential {}: {}", path.display(), e),
        )
    })?;

    let stored: StoredCredential = serde_json::from_str(&content).map_err(|e| {
        TransferError::credential(
            backend,
            format!("invalid credential {}: {}", path.display(), e),
        )
    })?;

    if stored.refresh_token.trim().is_empty() {
        return Err(TransferError::credential(
            backend,
            format!("credential {} has no refresh token", path.display()),
        ));
    }
    Ok(stored.refresh_token)
}

/// Exchange a refresh token for an access token.
pub async fn exchange_refresh_token(
    client: &reqwest::Client,
    backend: BackendKind,
    token_url: &str,
    form: &[(&str, &str)],
) -> TransferResult<String> {
    let response = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|e| classify_reqwest(backend, e))?;

    let status = response.status();
    let body = response.text().await.map_err(|e| classify_reqwest(backend, e))?;

    if !status.is_success() {
        // A revoked or expired grant comes back as 400 invalid_grant
        if status == StatusCode::BAD_REQUEST && body.contains("invalid_grant") {
            return Err(TransferError::credential(backend, "refresh token was rejected"));
        }
        return Err(classify_status(backend, status, &body));
    }

    let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
        TransferError::permanent(backend, format!("unexpected token response: {}", e))
    })?;
    debug!(backend = %backend, "Access token refreshed");
    Ok(token.access_token)
}

/// Map a non-success HTTP status onto the transfer error classes.
pub fn classify_status(backend: BackendKind, status: StatusCode, body: &str) -> TransferError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    if status == StatusCode::UNAUTHORIZED {
        TransferError::credential(backend, message)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        TransferError::transient(backend, message)
    } else {
        TransferError::permanent(backend, message)
    }
}

pub fn classify_reqwest(backend: BackendKind, err: reqwest::Error) -> TransferError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        TransferError::transient(backend, err.to_string())
    } else {
        TransferError::permanent(backend, err.to_string())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
