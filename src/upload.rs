use crate::config::CloudSettings;
use crate::joblog::now_ms;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DRIVE_UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=resumable";
/// Access tokens live for an hour; refresh a little before that.
pub const TOKEN_REFRESH_AFTER_SECS: i64 = 3500;
const HTTP_TIMEOUT_SECS: u64 = 60 * 60;
const USER_AGENT: &str = concat!("fetchdeck/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub remote_id: String,
    pub name: String,
    pub bytes: u64,
}

/// Sends a finished artifact to remote storage.
pub trait ArtifactUploader: Send + Sync {
    fn upload(&self, path: &Path) -> Result<UploadReceipt>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// When `access_token` was issued.
    pub obtained_at_ms: i64,
}

impl CloudTokens {
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        self.access_token.is_empty()
            || now_ms.saturating_sub(self.obtained_at_ms) >= TOKEN_REFRESH_AFTER_SECS * 1000
    }
}

pub fn load_tokens(paths: &AppPaths) -> Result<Option<CloudTokens>> {
    let path = paths.cloud_tokens_path();
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    let tokens: CloudTokens = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidConfig(format!(
            "failed to parse cloud tokens at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(Some(tokens))
}

pub fn save_tokens(paths: &AppPaths, tokens: &CloudTokens) -> Result<()> {
    let path = paths.cloud_tokens_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(tokens)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

pub struct GoogleDriveUploader {
    paths: AppPaths,
    client_id: String,
    client_secret: String,
    agent: ureq::Agent,
    tokens: Mutex<CloudTokens>,
}

impl GoogleDriveUploader {
    /// `None` when no account is connected or the OAuth client is not configured.
    pub fn from_settings(paths: &AppPaths, cloud: &CloudSettings) -> Result<Option<Self>> {
        let (Some(client_id), Some(client_secret)) = (
            non_empty(cloud.client_id.as_deref()),
            non_empty(cloud.client_secret.as_deref()),
        ) else {
            return Ok(None);
        };
        let Some(tokens) = load_tokens(paths)? else {
            return Ok(None);
        };
        if tokens.refresh_token.is_none() && tokens.access_token.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            paths: paths.clone(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            agent: build_agent(),
            tokens: Mutex::new(tokens),
        }))
    }

    fn access_token(&self) -> Result<String> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if !tokens.needs_refresh(now_ms()) {
            return Ok(tokens.access_token.clone());
        }
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            EngineError::Upstream("access token expired and no refresh token is stored".to_string())
        })?;

        let response = self
            .agent
            .post(TOKEN_URL)
            .send_form([
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .map_err(|e| EngineError::Upstream(format!("token refresh failed: {e}")))?;
        let body = read_success_body(response, "token refresh")?;
        let refreshed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::Upstream(format!("token refresh returned bad json: {e}")))?;

        tokens.access_token = refreshed.access_token;
        if refreshed.refresh_token.is_some() {
            tokens.refresh_token = refreshed.refresh_token;
        }
        tokens.obtained_at_ms = now_ms();
        save_tokens(&self.paths, &tokens)?;
        Ok(tokens.access_token.clone())
    }
}

impl ArtifactUploader for GoogleDriveUploader {
    fn upload(&self, path: &Path) -> Result<UploadReceipt> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| EngineError::InvalidRequest("upload path has no file name".to_string()))?;
        let bytes = std::fs::metadata(path)?.len();
        let token = self.access_token()?;

        let metadata = serde_json::json!({ "name": name });
        let init = self
            .agent
            .post(DRIVE_UPLOAD_URL)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json; charset=UTF-8")
            .header("X-Upload-Content-Length", bytes.to_string())
            .send(serde_json::to_vec(&metadata)?)
            .map_err(|e| EngineError::Upstream(format!("upload init failed: {e}")))?;
        if init.status().as_u16() >= 400 {
            let status = init.status();
            let body = read_body(init);
            return Err(EngineError::Upstream(format!(
                "upload init failed (status={status}): {}",
                body.trim()
            )));
        }
        let session = init
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Upstream("upload init returned no session location".to_string())
            })?;

        let file = std::fs::File::open(path)?;
        let response = self
            .agent
            .put(session.as_str())
            .header("Content-Length", bytes.to_string())
            .send(file)
            .map_err(|e| EngineError::Upstream(format!("upload failed: {e}")))?;
        let body = read_success_body(response, "upload")?;
        let created: DriveFile = serde_json::from_str(&body)
            .map_err(|e| EngineError::Upstream(format!("upload returned bad json: {e}")))?;

        Ok(UploadReceipt {
            remote_id: created.id,
            name: created.name.unwrap_or(name),
            bytes,
        })
    }
}

fn build_agent() -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(HTTP_TIMEOUT_SECS)))
        .user_agent(USER_AGENT);
    config.build().into()
}

fn read_body(response: ureq::http::Response<ureq::Body>) -> String {
    let mut body = String::new();
    let _ = response.into_body().into_reader().read_to_string(&mut body);
    body
}

fn read_success_body(response: ureq::http::Response<ureq::Body>, what: &str) -> Result<String> {
    let status = response.status();
    let body = read_body(response);
    if status.as_u16() >= 400 {
        return Err(EngineError::Upstream(format!(
            "{what} failed (status={status}): {}",
            body.trim()
        )));
    }
    Ok(body)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
