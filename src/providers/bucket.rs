use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use chrono::{TimeZone, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument};

use crate::config::BucketConfig;
use crate::provider::{
    generate_file_id, FileResponse, ProviderKind, ProviderMetadata, ReadRequest, StorageProvider,
    UploadFile, UploadOptions, UploadResult,
};

/// Object-bucket backend via the AWS SDK
///
/// The reference implementation for correct HTTP read semantics: caller
/// conditional headers map onto the SDK's structured equivalents, and the
/// backend's canonical metadata is written back onto the outgoing
/// response (304 for unmet conditions, 206 for satisfied ranges).
pub struct BucketProvider {
    config: BucketConfig,
    // Built on first use; SDK construction needs the async config loader
    client: OnceCell<S3Client>,
}

impl BucketProvider {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    fn bucket(&self) -> &str {
        self.config.bucket.as_deref().unwrap_or_default()
    }

    async fn client(&self) -> &S3Client {
        self.client
            .get_or_init(|| async {
                let aws_config = aws_config::defaults(BehaviorVersion::latest())
                    .region(aws_config::Region::new(self.config.region.clone()))
                    .load()
                    .await;

                let mut builder = S3ConfigBuilder::from(&aws_config);

                if let Some(ref endpoint_url) = self.config.endpoint_url {
                    builder = builder.endpoint_url(endpoint_url);
                }

                if self.config.force_path_style {
                    builder = builder.force_path_style(true);
                }

                info!(
                    bucket = %self.bucket(),
                    region = %self.config.region,
                    "bucket client initialized"
                );

                S3Client::from_conf(builder.build())
            })
            .await
    }
}

#[async_trait]
impl StorageProvider for BucketProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Bucket
    }

    fn is_configured(&self) -> bool {
        self.config.bucket.as_deref().is_some_and(|b| !b.is_empty())
    }

    #[instrument(skip(self, file, options), fields(file_name = %file.file_name, size = file.size()))]
    async fn upload(&self, file: &UploadFile, options: &UploadOptions) -> UploadResult {
        if !self.is_configured() {
            return UploadResult::failure("Bucket not configured");
        }

        let file_name = options.effective_file_name(file).to_string();
        let content_type = options.effective_content_type(file).to_string();
        let file_id = generate_file_id(&file_name);

        let mut request = self
            .client()
            .await
            .put_object()
            .bucket(self.bucket())
            .key(&file_id)
            .body(ByteStream::from(file.data.to_vec()))
            .content_type(&content_type)
            .cache_control(&self.config.cache_control)
            .metadata("original-name", &file_name)
            .metadata("upload-time", Utc::now().to_rfc3339());

        for (key, value) in &options.custom_metadata {
            request = request.metadata(key, value);
        }

        match request.send().await {
            Ok(_) => {
                debug!(file_id = %file_id, "object stored in bucket");
                UploadResult::ok(
                    file_id.clone(),
                    ProviderMetadata {
                        storage_provider: self.name(),
                        storage_id: file_id,
                        file_name,
                        file_size: file.size(),
                        content_type,
                    },
                )
            }
            Err(e) => {
                error!(error = %e, "bucket upload failed");
                UploadResult::failure(format!("Bucket upload failed: {e}"))
            }
        }
    }

    #[instrument(skip(self, request))]
    async fn get_file(&self, storage_id: &str, request: &ReadRequest) -> FileResponse {
        if !self.is_configured() {
            return FileResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "Bucket not configured");
        }

        let mut get = self
            .client()
            .await
            .get_object()
            .bucket(self.bucket())
            .key(storage_id);

        // Pass caller conditions through as structured equivalents
        if let Some(etag) = request.if_none_match() {
            get = get.if_none_match(etag);
        }
        if let Some(since) = request.if_modified_since() {
            if let Ok(when) = chrono::DateTime::parse_from_rfc2822(since) {
                get = get.if_modified_since(aws_sdk_s3::primitives::DateTime::from_millis(
                    when.timestamp_millis(),
                ));
            }
        }
        if let Some(range) = request.range() {
            get = get.range(range);
        }

        let output = match get.send().await {
            Ok(output) => output,
            Err(e) => {
                if let Some(raw) = e.raw_response() {
                    match raw.status().as_u16() {
                        // Condition unmet: the conditional GET succeeded
                        // with nothing to transfer
                        304 => return FileResponse::not_modified(HeaderMap::new()),
                        412 => {
                            return FileResponse::error(
                                StatusCode::PRECONDITION_FAILED,
                                "Precondition failed",
                            )
                        }
                        _ => {}
                    }
                }
                if e.into_service_error().is_no_such_key() {
                    return FileResponse::not_found("File not found");
                }
                error!(storage_id = %storage_id, "bucket get failed");
                return FileResponse::error(StatusCode::BAD_GATEWAY, "Failed to retrieve file");
            }
        };

        // Write the backend's canonical HTTP metadata onto the response
        let mut headers = HeaderMap::new();
        if let Some(content_type) = output.content_type().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        if let Some(etag) = output.e_tag().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(header::ETAG, etag);
        }
        if let Some(modified) = output.last_modified() {
            if let Some(when) = Utc.timestamp_millis_opt(modified.to_millis().unwrap_or(0)).single() {
                if let Ok(value) = HeaderValue::from_str(&when.to_rfc2822()) {
                    headers.insert(header::LAST_MODIFIED, value);
                }
            }
        }
        let cache_control = output
            .cache_control()
            .unwrap_or(self.config.cache_control.as_str());
        if let Ok(value) = HeaderValue::from_str(cache_control) {
            headers.insert(header::CACHE_CONTROL, value);
        }

        // A content range means the backend satisfied a byte range
        let status = if let Some(content_range) = output.content_range() {
            if let Ok(value) = HeaderValue::from_str(content_range) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };

        match output.body.collect().await {
            Ok(aggregated) => FileResponse::with_status(status, aggregated.into_bytes(), headers),
            Err(e) => {
                error!(error = %e, "bucket body read failed");
                FileResponse::error(StatusCode::BAD_GATEWAY, "Failed to retrieve file")
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, storage_id: &str) -> bool {
        if !self.is_configured() {
            return false;
        }

        match self
            .client()
            .await
            .delete_object()
            .bucket(self.bucket())
            .key(storage_id)
            .send()
            .await
        {
            // DeleteObject succeeds for absent keys too, which gives us
            // idempotency for free
            Ok(_) => {
                debug!(storage_id = %storage_id, "object deleted from bucket");
                true
            }
            Err(e) => {
                error!(error = %e, "bucket delete failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bucket: Option<&str>) -> BucketConfig {
        BucketConfig {
            bucket: bucket.map(str::to_string),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            cache_control: "public, max-age=31536000".to_string(),
        }
    }

    #[test]
    fn test_is_configured_requires_bucket_name() {
        assert!(BucketProvider::new(config(Some("files"))).is_configured());
        assert!(!BucketProvider::new(config(None)).is_configured());
        assert!(!BucketProvider::new(config(Some(""))).is_configured());
    }

    #[tokio::test]
    async fn test_unconfigured_calls_fail_without_client_construction() {
        let provider = BucketProvider::new(config(None));

        let result = provider
            .upload(
                &UploadFile::new(&b"data"[..], "a.txt", "text/plain"),
                &UploadOptions::default(),
            )
            .await;
        assert!(!result.success);

        let response = provider.get_file("a.txt", &ReadRequest::default()).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

        assert!(!provider.delete_file("a.txt").await);
    }
}
