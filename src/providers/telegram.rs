use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::config::TelegramConfig;
use crate::provider::{
    file_extension, FileResponse, ProviderKind, ProviderMetadata, ReadRequest, StorageProvider,
    UploadFile, UploadOptions, UploadResult,
};

/// Retries after the first attempt, shared by the network-backoff and
/// photo-to-document paths
const MAX_RETRIES: u32 = 2;

/// Chat-relay backend over the Telegram Bot API
///
/// Uploads relay the file to a channel via the bot send endpoints; reads
/// are a two-step indirection (`getFile` for a short-lived path, then the
/// actual download). Deletion is not supported by the Bot API, so it is a
/// metadata-only operation for callers.
pub struct TelegramProvider {
    config: TelegramConfig,
    client: reqwest::Client,
}

/// Bot API sub-endpoint chosen per MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendKind {
    Photo,
    Audio,
    Video,
    Document,
}

impl SendKind {
    fn for_content_type(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            SendKind::Photo
        } else if content_type.starts_with("audio/") {
            SendKind::Audio
        } else if content_type.starts_with("video/") {
            SendKind::Video
        } else {
            SendKind::Document
        }
    }

    fn endpoint(self) -> &'static str {
        match self {
            SendKind::Photo => "sendPhoto",
            SendKind::Audio => "sendAudio",
            SendKind::Video => "sendVideo",
            SendKind::Document => "sendDocument",
        }
    }

    fn field(self) -> &'static str {
        match self {
            SendKind::Photo => "photo",
            SendKind::Audio => "audio",
            SendKind::Video => "video",
            SendKind::Document => "document",
        }
    }
}

impl TelegramProvider {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn bot_token(&self) -> &str {
        self.config.bot_token.as_deref().unwrap_or_default()
    }

    fn chat_id(&self) -> &str {
        self.config.chat_id.as_deref().unwrap_or_default()
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.config.api_base, self.bot_token(), method)
    }

    fn build_form(&self, kind: SendKind, file: &UploadFile, file_name: &str, content_type: &str) -> Form {
        let part = Part::bytes(file.data.to_vec()).file_name(file_name.to_string());
        let part = part
            .mime_str(content_type)
            .unwrap_or_else(|_| Part::bytes(file.data.to_vec()).file_name(file_name.to_string()));
        Form::new()
            .text("chat_id", self.chat_id().to_string())
            .part(kind.field(), part)
    }

    /// Send the file, retrying bounded: network errors back off linearly,
    /// and a rejected photo is retried once more as a document (some relay
    /// backends refuse certain images as photos but take them as documents).
    async fn send_to_telegram(
        &self,
        file: &UploadFile,
        file_name: &str,
        content_type: &str,
    ) -> Result<Value, String> {
        let mut kind = SendKind::for_content_type(content_type);
        let mut attempt: u32 = 0;

        loop {
            let form = self.build_form(kind, file, file_name, content_type);
            let request = self.client.post(self.api_url(kind.endpoint())).multipart(form);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body: Value = response.json().await.unwrap_or(Value::Null);

                    if status.is_success() && body["ok"].as_bool().unwrap_or(false) {
                        return Ok(body);
                    }

                    if kind == SendKind::Photo && attempt < MAX_RETRIES {
                        debug!(status = %status, "photo upload rejected, retrying as document");
                        kind = SendKind::Document;
                        attempt += 1;
                        continue;
                    }

                    let description = body["description"]
                        .as_str()
                        .unwrap_or("Upload to Telegram failed")
                        .to_string();
                    return Err(description);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        warn!(error = %e, attempt = attempt, "telegram network error, retrying");
                        tokio::time::sleep(Duration::from_secs((attempt + 1) as u64)).await;
                        attempt += 1;
                        continue;
                    }
                    error!(error = %e, "telegram upload failed after retries");
                    return Err("Network error occurred".to_string());
                }
            }
        }
    }

    /// Resolve the short-lived download path for a stored file id
    async fn get_file_path(&self, telegram_file_id: &str) -> Option<String> {
        let url = format!("{}?file_id={}", self.api_url("getFile"), telegram_file_id);

        match self.client.get(&url).send().await {
            Ok(response) => {
                let body: Value = response.json().await.ok()?;
                if body["ok"].as_bool().unwrap_or(false) {
                    body["result"]["file_path"].as_str().map(str::to_string)
                } else {
                    None
                }
            }
            Err(e) => {
                error!(error = %e, "failed to resolve telegram file path");
                None
            }
        }
    }
}

/// Pull the backend-assigned file id out of a Bot API send response
///
/// Photos come back as a resolution ladder; the largest variant by byte
/// size is the one worth keeping.
fn extract_file_id(response: &Value) -> Option<String> {
    let result = response.get("result")?;

    if let Some(photos) = result.get("photo").and_then(Value::as_array) {
        return photos
            .iter()
            .max_by_key(|p| p["file_size"].as_u64().unwrap_or(0))
            .and_then(|p| p["file_id"].as_str())
            .map(str::to_string);
    }

    for field in ["document", "video", "audio"] {
        if let Some(id) = result[field]["file_id"].as_str() {
            return Some(id.to_string());
        }
    }

    None
}

#[async_trait]
impl StorageProvider for TelegramProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Telegram
    }

    fn is_configured(&self) -> bool {
        self.config.bot_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.config.chat_id.as_deref().is_some_and(|c| !c.is_empty())
    }

    #[instrument(skip(self, file, options), fields(file_name = %file.file_name, size = file.size()))]
    async fn upload(&self, file: &UploadFile, options: &UploadOptions) -> UploadResult {
        if !self.is_configured() {
            return UploadResult::failure("Telegram not configured");
        }

        let file_name = options.effective_file_name(file);
        let content_type = options.effective_content_type(file);

        let response = match self.send_to_telegram(file, file_name, content_type).await {
            Ok(body) => body,
            Err(e) => return UploadResult::failure(e),
        };

        let Some(telegram_file_id) = extract_file_id(&response) else {
            return UploadResult::failure("Failed to extract file ID from Telegram response");
        };

        let file_id = match file_extension(file_name) {
            Some(ext) => format!("{telegram_file_id}.{ext}"),
            None => telegram_file_id.clone(),
        };

        UploadResult::ok(
            file_id,
            ProviderMetadata {
                storage_provider: self.name(),
                storage_id: telegram_file_id,
                file_name: file_name.to_string(),
                file_size: file.size(),
                content_type: content_type.to_string(),
            },
        )
    }

    /// Two-step read: resolve the file path, then stream the bytes.
    /// Conditional and range headers are ignored; the Bot API has no
    /// support for them.
    #[instrument(skip(self, _request))]
    async fn get_file(&self, storage_id: &str, _request: &ReadRequest) -> FileResponse {
        // Public ids carry a display extension the Bot API does not know about
        let telegram_file_id = storage_id.split('.').next().unwrap_or(storage_id);

        let Some(file_path) = self.get_file_path(telegram_file_id).await else {
            return FileResponse::not_found("File not found");
        };

        let url = format!(
            "{}/file/bot{}/{}",
            self.config.api_base,
            self.bot_token(),
            file_path
        );

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "telegram file download failed");
                return FileResponse::error(StatusCode::BAD_GATEWAY, "Failed to retrieve file");
            }
        };

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        let mut headers = HeaderMap::new();
        for name in [header::CONTENT_TYPE, header::CONTENT_LENGTH] {
            if let Some(value) = response.headers().get(name.as_str()) {
                if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                    headers.insert(name, value);
                }
            }
        }

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "telegram file body read failed");
                return FileResponse::error(StatusCode::BAD_GATEWAY, "Failed to retrieve file");
            }
        };

        FileResponse::with_status(status, body, headers)
    }

    async fn delete_file(&self, _storage_id: &str) -> bool {
        // The Bot API cannot delete relayed files; callers drop the
        // metadata record and the copy is orphaned on the channel.
        warn!("telegram does not support file deletion, treating as success");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(token: Option<&str>, chat: Option<&str>) -> TelegramProvider {
        TelegramProvider::new(TelegramConfig {
            bot_token: token.map(str::to_string),
            chat_id: chat.map(str::to_string),
            api_base: "https://api.telegram.org".to_string(),
        })
    }

    #[test]
    fn test_is_configured_requires_both_credentials() {
        assert!(provider(Some("token"), Some("chat")).is_configured());
        assert!(!provider(Some("token"), None).is_configured());
        assert!(!provider(None, Some("chat")).is_configured());
        assert!(!provider(Some(""), Some("chat")).is_configured());
    }

    #[tokio::test]
    async fn test_upload_unconfigured_returns_failure_without_panicking() {
        let result = provider(None, None)
            .upload(
                &UploadFile::new(&b"data"[..], "a.txt", "text/plain"),
                &UploadOptions::default(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Telegram not configured"));
    }

    #[test]
    fn test_send_kind_by_content_type() {
        assert_eq!(SendKind::for_content_type("image/png"), SendKind::Photo);
        assert_eq!(SendKind::for_content_type("audio/mpeg"), SendKind::Audio);
        assert_eq!(SendKind::for_content_type("video/mp4"), SendKind::Video);
        assert_eq!(SendKind::for_content_type("application/zip"), SendKind::Document);
        assert_eq!(SendKind::for_content_type(""), SendKind::Document);
    }

    #[test]
    fn test_extract_file_id_prefers_largest_photo_variant() {
        let response = json!({
            "ok": true,
            "result": {
                "photo": [
                    { "file_id": "small", "file_size": 1000 },
                    { "file_id": "large", "file_size": 90000 },
                    { "file_id": "medium", "file_size": 20000 }
                ]
            }
        });
        assert_eq!(extract_file_id(&response).as_deref(), Some("large"));
    }

    #[test]
    fn test_extract_file_id_document_video_audio() {
        for field in ["document", "video", "audio"] {
            let response = json!({ "ok": true, "result": { field: { "file_id": "f-1" } } });
            assert_eq!(extract_file_id(&response).as_deref(), Some("f-1"));
        }
        assert!(extract_file_id(&json!({ "ok": true, "result": {} })).is_none());
        assert!(extract_file_id(&json!({ "ok": false })).is_none());
    }

    #[tokio::test]
    async fn test_delete_is_noop_and_idempotent() {
        let p = provider(Some("token"), Some("chat"));
        assert!(p.delete_file("abc.jpg").await);
        assert!(p.delete_file("abc.jpg").await);
    }
}
