//! HTTP client for the tutor backend.
//!
//! [`ApiClient`] is the only component that performs network I/O. Each
//! method is a single request/response round trip against the configured
//! base URL, bounded by one per-attempt deadline that covers both sending
//! the request and reading the body. On expiry the in-flight request is
//! dropped and [`ApiError::Timeout`] is returned; the backend may still
//! finish the work.
//!
//! The client never retries. Callers that want retries wrap calls in
//! [`crate::retry::with_retry`].
//!
//! # Endpoints
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | `GET`  | `/` | [`ApiClient::service_info`] |
//! | `GET`  | `/health` | [`ApiClient::get_health`] |
//! | `POST` | `/upload` | [`ApiClient::upload_document`] |
//! | `POST` | `/chat` | [`ApiClient::send_question`] |
//! | `GET`  | `/images/{topic_id}` | [`ApiClient::get_images`] |
//! | `GET`  | `/files` | [`ApiClient::list_files`] |
//! | `DELETE` | `/files/{filename}` | [`ApiClient::delete_file`] |
//! | `POST` | `/analytics/events` | [`ApiClient::post_analytics`] |

use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::error::ApiError;
use crate::models::{
    AnalyticsEvent, ChatResponse, FileEntry, HealthStatus, ImageCatalog, ServiceInfo,
    UploadResult,
};

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_file_size_bytes: u64,
    allowed_extensions: Vec<String>,
    max_message_length: usize,
    images_dir: PathBuf,
}

#[derive(Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent())
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            timeout: config.api.timeout(),
            max_file_size_bytes: config.upload.max_file_size_bytes(),
            allowed_extensions: config
                .upload
                .allowed_extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
            max_message_length: config.chat.max_message_length,
            images_dir: config.images.dir.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Override the per-attempt deadline taken from `[api].timeout_secs`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Run one request attempt (send plus body read) under the deadline.
    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout {
                after: self.timeout,
            }),
        }
    }

    // ============ Upload ============

    /// Check a file against the configured extension and size limits.
    pub fn validate_upload(&self, filename: &str, size: u64) -> Result<(), ApiError> {
        let lower = filename.to_ascii_lowercase();
        if !self.allowed_extensions.iter().any(|ext| lower.ends_with(ext)) {
            return Err(ApiError::Validation(format!(
                "Only {} files are allowed",
                self.allowed_extensions.join(", ")
            )));
        }
        if size == 0 {
            return Err(ApiError::Validation(format!("{} is empty", filename)));
        }
        if size > self.max_file_size_bytes {
            return Err(ApiError::Validation(format!(
                "File too large. Maximum size: {}MB",
                self.max_file_size_bytes / (1024 * 1024)
            )));
        }
        Ok(())
    }

    /// Read `path` from disk and upload it.
    pub async fn upload_document(&self, path: &Path) -> Result<UploadResult, ApiError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ApiError::Validation(format!("invalid file path: {}", path.display())))?
            .to_string();

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ApiError::Validation(format!("cannot read {}: {}", path.display(), e)))?;
        self.validate_upload(&filename, meta.len())?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ApiError::Validation(format!("cannot read {}: {}", path.display(), e)))?;
        self.upload_bytes(&filename, bytes).await
    }

    /// Upload an in-memory document as multipart field `file`.
    pub async fn upload_bytes(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResult, ApiError> {
        self.validate_upload(filename, bytes.len() as u64)?;

        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/pdf")
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        let form = Form::new().part("file", part);

        tracing::debug!(filename, "POST /upload");
        self.with_deadline(async {
            let resp = self
                .http
                .post(self.url("/upload"))
                .multipart(form)
                .send()
                .await
                .map_err(transport_error)?;

            let status = resp.status();
            if !status.is_success() {
                let reason = error_detail(resp).await;
                return Err(ApiError::Upload {
                    status: status.as_u16(),
                    reason,
                });
            }
            decode(resp).await
        })
        .await
    }

    // ============ Chat ============

    pub fn validate_question(&self, text: &str) -> Result<(), ApiError> {
        if text.trim().is_empty() {
            return Err(ApiError::Validation("Question cannot be empty".to_string()));
        }
        if text.chars().count() > self.max_message_length {
            return Err(ApiError::Validation(format!(
                "Question too long (max {} characters)",
                self.max_message_length
            )));
        }
        Ok(())
    }

    pub async fn send_question(&self, text: &str, topic_id: &str) -> Result<ChatResponse, ApiError> {
        self.validate_question(text)?;
        let body = serde_json::json!({
            "question": text.trim(),
            "topic_id": topic_id,
        });

        tracing::debug!(topic_id, "POST /chat");
        self.with_deadline(async {
            let resp = self
                .http
                .post(self.url("/chat"))
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = resp.status();
            if !status.is_success() {
                return Err(ApiError::Chat {
                    status: status.as_u16(),
                });
            }
            decode(resp).await
        })
        .await
    }

    // ============ Health ============

    /// Never fails: any transport problem maps to [`HealthStatus::Unreachable`].
    pub async fn get_health(&self) -> HealthStatus {
        let result = self
            .with_deadline(async {
                let resp = self
                    .http
                    .get(self.url("/health"))
                    .send()
                    .await
                    .map_err(transport_error)?;
                if !resp.status().is_success() {
                    return Ok(HealthStatus::Degraded);
                }
                let body: HealthBody = match resp.json().await {
                    Ok(body) => body,
                    Err(_) => return Ok(HealthStatus::Degraded),
                };
                Ok(if body.status == "healthy" {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                })
            })
            .await;

        match result {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(error = %e, "health check failed");
                HealthStatus::Unreachable
            }
        }
    }

    // ============ Files / images / info ============

    pub async fn list_files(&self) -> Result<Vec<FileEntry>, ApiError> {
        let list: FileList = self.get_json("/files", "file list").await?;
        Ok(list.files)
    }

    pub async fn delete_file(&self, filename: &str) -> Result<(), ApiError> {
        let path = segment_path("files", filename);
        tracing::debug!(filename, "DELETE /files");
        self.with_deadline(async {
            let resp = self
                .http
                .delete(self.url(&path))
                .send()
                .await
                .map_err(transport_error)?;
            check_crud(resp, filename).await.map(|_| ())
        })
        .await
    }

    pub async fn get_images(&self, topic_id: &str) -> Result<ImageCatalog, ApiError> {
        let path = segment_path("images", topic_id);
        self.get_json(&path, topic_id).await
    }

    pub async fn service_info(&self) -> Result<ServiceInfo, ApiError> {
        self.get_json("/", "service info").await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, resource: &str) -> Result<T, ApiError> {
        tracing::debug!(path, "GET");
        self.with_deadline(async {
            let resp = self
                .http
                .get(self.url(path))
                .send()
                .await
                .map_err(transport_error)?;
            let resp = check_crud(resp, resource).await?;
            decode(resp).await
        })
        .await
    }

    // ============ Analytics ============

    pub async fn post_analytics(&self, events: &[AnalyticsEvent]) -> Result<(), ApiError> {
        let body = serde_json::json!({ "events": events });
        self.with_deadline(async {
            let resp = self
                .http
                .post(self.url("/analytics/events"))
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;
            check_crud(resp, "analytics").await.map(|_| ())
        })
        .await
    }

    /// Local path of a diagram referenced by an answer (`pics/<filename>`).
    ///
    /// Only the final component of `filename` is used, so a name sent by the
    /// backend cannot point outside the images directory.
    pub fn image_path(&self, filename: &str) -> PathBuf {
        match Path::new(filename).file_name() {
            Some(name) => self.images_dir.join(name),
            None => self.images_dir.clone(),
        }
    }
}

pub fn user_agent() -> String {
    format!("ai-tutor/{}", env!("CARGO_PKG_VERSION"))
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    ApiError::Network(e.to_string())
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let bytes = resp.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Map file/image CRUD statuses: 404 → `NotFound`, other non-2xx → `Request`.
async fn check_crud(resp: Response, resource: &str) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound {
            resource: resource.to_string(),
        });
    }
    let message = error_detail(resp).await;
    Err(ApiError::Request {
        status: status.as_u16(),
        message,
    })
}

/// Extract FastAPI's `{"detail": ...}` from an error body, falling back to
/// the raw text.
async fn error_detail(resp: Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| match v.get("detail") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        })
        .unwrap_or(text)
}

/// `/<collection>/<segment>` with the segment percent-encoded.
fn segment_path(collection: &str, segment: &str) -> String {
    format!("/{}/{}", collection, urlencoding::encode(segment))
}
