use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised inside provider implementations
///
/// These never cross the `StorageProvider` boundary directly: `upload`
/// folds them into a failed [`UploadResult`] and `get_file` into an error
/// [`FileResponse`]. Expected backend unavailability is data, not a panic.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(ProviderKind),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("backend rejected request: {0}")]
    Backend(String),

    #[error("unexpected backend response: {0}")]
    BadResponse(String),
}

/// Supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Chat-relay store over the Telegram Bot API
    Telegram,
    /// Object bucket via the AWS SDK client
    Bucket,
    /// Any S3-protocol endpoint via hand-signed REST calls
    S3,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::Telegram, ProviderKind::Bucket, ProviderKind::S3];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Telegram => "telegram",
            ProviderKind::Bucket => "bucket",
            ProviderKind::S3 => "s3",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(ProviderKind::Telegram),
            "bucket" | "r2" => Ok(ProviderKind::Bucket),
            "s3" => Ok(ProviderKind::S3),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Error for provider names not in the registry
#[derive(Debug, Error)]
#[error("unknown storage provider: {0}")]
pub struct UnknownProvider(pub String);

/// An upload payload with its descriptive attributes
///
/// The body is a cheaply clonable [`Bytes`] so mirror tasks can reuse the
/// original payload without copying.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub data: Bytes,
    pub file_name: String,
    pub content_type: String,
}

impl UploadFile {
    pub fn new(data: impl Into<Bytes>, file_name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Per-upload options
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Overrides the payload's file name
    pub file_name: Option<String>,
    /// Overrides the payload's content type
    pub content_type: Option<String>,
    /// Custom metadata attached to the stored object where supported
    pub custom_metadata: HashMap<String, String>,
}

impl UploadOptions {
    pub fn effective_file_name<'a>(&'a self, file: &'a UploadFile) -> &'a str {
        self.file_name.as_deref().unwrap_or(&file.file_name)
    }

    pub fn effective_content_type<'a>(&'a self, file: &'a UploadFile) -> &'a str {
        self.content_type.as_deref().unwrap_or(&file.content_type)
    }
}

/// Backend-specific details recorded alongside a successful upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Provider that holds the copy
    pub storage_provider: ProviderKind,
    /// Backend-assigned identifier (may differ from the public file id)
    pub storage_id: String,
    /// Original file name
    pub file_name: String,
    /// Size in bytes
    pub file_size: u64,
    /// Content type supplied at upload
    pub content_type: String,
}

/// Outcome of a single provider upload
///
/// Recoverable backend failures are reported through `success = false`
/// plus `error`, never by panicking; callers branch on `success`.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub success: bool,
    /// Public file id used in `/file/{id}` URLs
    pub file_id: String,
    /// Serving path for the uploaded file
    pub url: String,
    pub error: Option<String>,
    pub metadata: Option<ProviderMetadata>,
    /// Backend placement record, filled in by the redundancy layer
    pub storage: Option<crate::metadata::StorageInfo>,
}

impl UploadResult {
    pub fn ok(file_id: String, metadata: ProviderMetadata) -> Self {
        let url = format!("/file/{file_id}");
        Self {
            success: true,
            file_id,
            url,
            error: None,
            metadata: Some(metadata),
            storage: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            file_id: String::new(),
            url: String::new(),
            error: Some(error.into()),
            metadata: None,
            storage: None,
        }
    }
}

/// Read-side request context passed through to backends
///
/// Carries the caller's conditional and range headers. Backends without
/// native support simply ignore them.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    pub headers: HeaderMap,
}

impl ReadRequest {
    pub fn from_headers(headers: HeaderMap) -> Self {
        Self { headers }
    }

    fn header_str(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.header_str(header::IF_NONE_MATCH)
    }

    pub fn if_modified_since(&self) -> Option<&str> {
        self.header_str(header::IF_MODIFIED_SINCE)
    }

    pub fn range(&self) -> Option<&str> {
        self.header_str(header::RANGE)
    }
}

/// Backend-agnostic response for file reads
#[derive(Debug)]
pub struct FileResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl FileResponse {
    pub fn ok(body: Bytes, headers: HeaderMap) -> Self {
        Self {
            status: StatusCode::OK,
            headers,
            body: Some(body),
        }
    }

    pub fn with_status(status: StatusCode, body: Bytes, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            body: Some(body),
        }
    }

    pub fn not_modified(headers: HeaderMap) -> Self {
        Self {
            status: StatusCode::NOT_MODIFIED,
            headers,
            body: None,
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::text(StatusCode::NOT_FOUND, message)
    }

    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::text(status, message)
    }

    fn text(status: StatusCode, message: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: Some(Bytes::copy_from_slice(message.as_bytes())),
        }
    }

    /// Whether this response satisfies the caller's read
    ///
    /// 304 counts: for a conditional GET it is the correct terminal answer,
    /// not a degraded one.
    pub fn is_usable(&self) -> bool {
        self.status.is_success() || self.status == StatusCode::NOT_MODIFIED
    }
}

/// Uniform contract over a single storage backend
///
/// `is_configured` must be checked before the other operations; providers
/// are not required to re-validate configuration on every call.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Which backend this is
    fn name(&self) -> ProviderKind;

    /// Pure function of injected configuration, no side effects
    fn is_configured(&self) -> bool;

    /// Store a file. Backend failures come back as `success = false`.
    async fn upload(&self, file: &UploadFile, options: &UploadOptions) -> UploadResult;

    /// Retrieve a file by its backend-specific identifier
    async fn get_file(&self, storage_id: &str, request: &ReadRequest) -> FileResponse;

    /// Delete a file. Idempotent: `true` covers "already absent".
    async fn delete_file(&self, storage_id: &str) -> bool;
}

/// Generate a public file id: `{millis}-{rand8}.{ext}`
///
/// The extension is carried so serving layers can infer a content type for
/// legacy records that lack one.
pub fn generate_file_id(file_name: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();

    match file_extension(file_name) {
        Some(ext) => format!("{timestamp}-{random}.{ext}"),
        None => format!("{timestamp}-{random}"),
    }
}

/// Lower-cased extension of a file name, if it has one
pub fn file_extension(file_name: &str) -> Option<String> {
    let ext = file_name.rsplit_once('.')?.1;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}
