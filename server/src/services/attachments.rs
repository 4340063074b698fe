//! Attachment handling: metadata validation and the upload collaborator.
//!
//! DESIGN
//! ======
//! Messages only ever carry a URL plus size/type metadata; bytes never flow
//! through the live channel. Uploads go through the REST endpoint, which
//! checks the extension, renames the file to a random name and hands the
//! bytes to an [`ObjectStorage`] implementation that returns a public URL.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use events::MessageKind;
use rand::Rng;

use crate::config::{PayloadLimits, StorageConfig};
use crate::event::ErrorCode;
use crate::services::session::bytes_to_hex;

pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "pdf"];

const UPLOAD_PREFIX: &str = "chat";
const STORAGE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: i64, max: i64 },
    #[error("empty file")]
    Empty,
    #[error("storage request failed: {0}")]
    Storage(String),
    #[error("file uploads are not configured")]
    NotConfigured,
}

impl ErrorCode for UploadError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedType(_) | Self::Empty => "E_UNSUPPORTED_FILE",
            Self::TooLarge { .. } => "E_FILE_TOO_LARGE",
            Self::Storage(_) => "E_STORAGE",
            Self::NotConfigured => "E_STORAGE_DISABLED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

// =============================================================================
// METADATA VALIDATION
// =============================================================================

/// Check the attachment fields of an image or file message.
///
/// # Errors
///
/// Returns a human-readable reason when the metadata is unusable.
pub fn validate_metadata(
    kind: MessageKind,
    file_url: Option<&str>,
    file_size: Option<i64>,
    file_type: Option<&str>,
    limits: &PayloadLimits,
) -> Result<(), String> {
    let Some(url) = file_url.map(str::trim).filter(|u| !u.is_empty()) else {
        return Err(format!("{} messages require file_url", kind.as_str()));
    };
    if !is_http_url(url) {
        return Err("file_url must be an http(s) URL".into());
    }
    if let Some(size) = file_size {
        if size <= 0 {
            return Err("file_size must be positive".into());
        }
        if size > limits.max_attachment_bytes {
            return Err(format!("file_size {size} exceeds {} bytes", limits.max_attachment_bytes));
        }
    }
    if kind == MessageKind::Image {
        if let Some(mime) = file_type {
            if !mime.starts_with("image/") {
                return Err(format!("image messages require an image/* file_type, got {mime}"));
            }
        }
    }
    Ok(())
}

#[must_use]
pub fn is_http_url(raw: &str) -> bool {
    raw.starts_with("http://") || raw.starts_with("https://")
}

// =============================================================================
// UPLOAD CLASSIFICATION
// =============================================================================

/// What an accepted upload turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadKind {
    pub extension: &'static str,
    pub content_type: &'static str,
    pub message_type: MessageKind,
}

/// Classify an upload by the extension of its client-supplied name.
///
/// # Errors
///
/// Returns [`UploadError::UnsupportedType`] for anything outside the allow list.
pub fn classify(filename: &str) -> Result<UploadKind, UploadError> {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let (extension, content_type, message_type) = match ext.as_str() {
        "jpg" | "jpeg" => ("jpg", "image/jpeg", MessageKind::Image),
        "png" => ("png", "image/png", MessageKind::Image),
        "gif" => ("gif", "image/gif", MessageKind::Image),
        "pdf" => ("pdf", "application/pdf", MessageKind::File),
        _ => return Err(UploadError::UnsupportedType(filename.to_string())),
    };
    Ok(UploadKind { extension, content_type, message_type })
}

/// Random object name; the client-supplied name is never used as a path.
#[must_use]
pub fn secure_filename(extension: &str) -> String {
    let bytes: [u8; 16] = rand::rng().random();
    format!("{}.{extension}", bytes_to_hex(&bytes))
}

/// Result of a successful upload, shaped for the client's next `message` send.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoredFile {
    pub file_url: String,
    pub file_size: i64,
    pub file_type: String,
    pub message_type: MessageKind,
}

/// Validate and store one uploaded file.
///
/// # Errors
///
/// Returns an [`UploadError`] for rejected files or storage failures.
pub async fn upload(
    storage: &dyn ObjectStorage,
    filename: &str,
    bytes: Vec<u8>,
    limits: &PayloadLimits,
) -> Result<StoredFile, UploadError> {
    let kind = classify(filename)?;
    let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
    if size == 0 {
        return Err(UploadError::Empty);
    }
    if size > limits.max_attachment_bytes {
        return Err(UploadError::TooLarge { size, max: limits.max_attachment_bytes });
    }

    let name = format!("{UPLOAD_PREFIX}/{}", secure_filename(kind.extension));
    let file_url = storage.put(&name, kind.content_type, bytes).await?;
    tracing::info!(%name, size, content_type = kind.content_type, "upload: stored attachment");
    Ok(StoredFile { file_url, file_size: size, file_type: kind.content_type.to_string(), message_type: kind.message_type })
}

// =============================================================================
// OBJECT STORAGE
// =============================================================================

/// External object store. Returns the public URL of the stored object.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, name: &str, content_type: &str, bytes: Vec<u8>) -> Result<String, UploadError>;
}

/// Storage API client (`POST {base}/object/{bucket}/{name}` with a bearer key).
pub struct HttpObjectStorage {
    http: reqwest::Client,
    config: StorageConfig,
}

impl HttpObjectStorage {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: StorageConfig) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(STORAGE_TIMEOUT_SECS))
            .build()
            .map_err(|e| UploadError::Storage(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/object/{}/{name}", self.config.base_url, self.config.bucket)
    }

    fn public_url(&self, name: &str) -> String {
        format!("{}/{name}", self.config.public_url)
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put(&self, name: &str, content_type: &str, bytes: Vec<u8>) -> Result<String, UploadError> {
        let response = self
            .http
            .post(self.object_url(name))
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, %body, "upload: storage rejected object");
            return Err(UploadError::Storage(format!("status {}", status.as_u16())));
        }
        Ok(self.public_url(name))
    }
}

/// In-process storage for development mode and tests.
pub struct MemoryObjectStorage {
    public_url: String,
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryObjectStorage {
    #[must_use]
    pub fn new(public_url: impl Into<String>) -> Self {
        Self { public_url: public_url.into(), objects: Mutex::new(HashMap::new()) }
    }

    /// Stored content type and bytes for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<(String, Vec<u8>)> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, name: &str, content_type: &str, bytes: Vec<u8>) -> Result<String, UploadError> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), (content_type.to_string(), bytes));
        Ok(format!("{}/{name}", self.public_url))
    }
}

#[cfg(test)]
#[path = "attachments_test.rs"]
mod tests;
