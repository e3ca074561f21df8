use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, error, instrument};

use crate::config::S3Config;
use crate::provider::{
    generate_file_id, FileResponse, ProviderKind, ProviderMetadata, ReadRequest, StorageProvider,
    UploadFile, UploadOptions, UploadResult,
};

type HmacSha256 = Hmac<Sha256>;

/// Sentinel payload hash for requests whose body is not buffered
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Signed-REST backend for any endpoint speaking the S3 protocol
///
/// Authenticates PUT/GET/DELETE with AWS Signature V4 computed by hand,
/// so it works against self-hosted object stores without pulling in an
/// SDK client per vendor. PUT bodies are content-hashed; GET/DELETE use
/// the unsigned-payload sentinel to avoid buffering.
pub struct SignedRestProvider {
    config: S3Config,
    client: reqwest::Client,
}

impl SignedRestProvider {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> &str {
        self.config.endpoint.as_deref().unwrap_or_default()
    }

    fn bucket(&self) -> &str {
        self.config.bucket.as_deref().unwrap_or_default()
    }

    /// Virtual-host-style endpoints already carry the bucket in the host;
    /// everything else gets path-style addressing.
    fn is_virtual_host_style(&self) -> bool {
        reqwest::Url::parse(self.endpoint())
            .ok()
            .and_then(|url| url.host_str().map(|h| h.contains(self.bucket())))
            .unwrap_or(false)
    }

    fn object_url(&self, key: &str) -> String {
        let endpoint = self.endpoint().trim_end_matches('/');
        if self.is_virtual_host_style() {
            format!("{endpoint}/{key}")
        } else {
            format!("{}/{}/{key}", endpoint, self.bucket())
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        if self.is_virtual_host_style() {
            format!("/{key}")
        } else {
            format!("/{}/{key}", self.bucket())
        }
    }

    /// Sign a request at `now`, returning the full header set including
    /// `Authorization`
    fn sign_request(
        &self,
        method: &str,
        canonical_uri: &str,
        extra_headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let region = &self.config.region;
        let access_key_id = self.config.access_key_id.as_deref().unwrap_or_default();
        let secret_access_key = self.config.secret_access_key.as_deref().unwrap_or_default();

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let host = reqwest::Url::parse(self.endpoint())
            .ok()
            .and_then(|url| {
                url.host_str().map(|h| match url.port() {
                    Some(port) => format!("{h}:{port}"),
                    None => h.to_string(),
                })
            })
            .unwrap_or_default();

        // BTreeMap keeps headers in the sorted order SigV4 canonicalization
        // requires
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        for (key, value) in extra_headers {
            headers.insert(key.to_ascii_lowercase(), value.clone());
        }

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = [
            method,
            canonical_uri,
            "", // query string
            &canonical_headers,
            &signed_headers,
            payload_hash,
        ]
        .join("\n");

        let credential_scope = format!("{date_stamp}/{region}/s3/aws4_request");
        let string_to_sign = [
            "AWS4-HMAC-SHA256",
            &amz_date,
            &credential_scope,
            &sha256_hex(canonical_request.as_bytes()),
        ]
        .join("\n");

        let k_date = hmac_sha256(format!("AWS4{secret_access_key}").as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={access_key_id}/{credential_scope}, \
             SignedHeaders={signed_headers}, Signature={signature}"
        );

        headers.insert("authorization".to_string(), authorization);
        headers
    }

    fn apply_headers(
        mut request: reqwest::RequestBuilder,
        headers: &BTreeMap<String, String>,
    ) -> reqwest::RequestBuilder {
        for (key, value) in headers {
            // reqwest sets Host itself from the URL
            if key != "host" {
                request = request.header(key, value);
            }
        }
        request
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[async_trait]
impl StorageProvider for SignedRestProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::S3
    }

    fn is_configured(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        set(&self.config.endpoint)
            && set(&self.config.bucket)
            && set(&self.config.access_key_id)
            && set(&self.config.secret_access_key)
    }

    #[instrument(skip(self, file, options), fields(file_name = %file.file_name, size = file.size()))]
    async fn upload(&self, file: &UploadFile, options: &UploadOptions) -> UploadResult {
        if !self.is_configured() {
            return UploadResult::failure("S3 not configured");
        }

        let file_name = options.effective_file_name(file).to_string();
        let content_type = options.effective_content_type(file).to_string();
        let file_id = generate_file_id(&file_name);

        let payload_hash = sha256_hex(&file.data);
        let mut extra = BTreeMap::new();
        extra.insert("content-type".to_string(), content_type.clone());
        extra.insert("content-length".to_string(), file.size().to_string());

        let headers = self.sign_request(
            "PUT",
            &self.canonical_uri(&file_id),
            &extra,
            &payload_hash,
            Utc::now(),
        );

        let request = Self::apply_headers(self.client.put(self.object_url(&file_id)), &headers)
            .body(file.data.clone());

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(file_id = %file_id, "object stored via signed REST");
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
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, "s3 upload rejected");
                UploadResult::failure(format!("S3 upload failed: {status}"))
            }
            Err(e) => {
                error!(error = %e, "s3 upload failed");
                UploadResult::failure(format!("S3 upload failed: {e}"))
            }
        }
    }

    /// Conditional headers are not forwarded; a plain signed GET keeps the
    /// signature independent of caller state. Byte ranges ride along
    /// unsigned, which SigV4 permits.
    #[instrument(skip(self, request))]
    async fn get_file(&self, storage_id: &str, request: &ReadRequest) -> FileResponse {
        if !self.is_configured() {
            return FileResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "S3 not configured");
        }

        let headers = self.sign_request(
            "GET",
            &self.canonical_uri(storage_id),
            &BTreeMap::new(),
            UNSIGNED_PAYLOAD,
            Utc::now(),
        );

        let mut builder = Self::apply_headers(self.client.get(self.object_url(storage_id)), &headers);
        if let Some(range) = request.range() {
            builder = builder.header(header::RANGE.as_str(), range);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "s3 get failed");
                return FileResponse::error(StatusCode::BAD_GATEWAY, "Failed to retrieve file");
            }
        };

        let status = response.status();
        if status.as_u16() == 404 {
            return FileResponse::not_found("File not found");
        }
        if !status.is_success() {
            error!(status = %status, storage_id = %storage_id, "s3 get rejected");
            return FileResponse::error(StatusCode::BAD_GATEWAY, "Failed to retrieve file");
        }

        let mut out_headers = HeaderMap::new();
        for name in [
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ETAG,
            header::LAST_MODIFIED,
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
        ] {
            if let Some(value) = response.headers().get(name.as_str()) {
                if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                    out_headers.insert(name, value);
                }
            }
        }
        if !out_headers.contains_key(header::CACHE_CONTROL) {
            out_headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=31536000"),
            );
        }

        let out_status =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);

        match response.bytes().await {
            Ok(body) => FileResponse::with_status(out_status, body, out_headers),
            Err(e) => {
                error!(error = %e, "s3 body read failed");
                FileResponse::error(StatusCode::BAD_GATEWAY, "Failed to retrieve file")
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, storage_id: &str) -> bool {
        if !self.is_configured() {
            return false;
        }

        let headers = self.sign_request(
            "DELETE",
            &self.canonical_uri(storage_id),
            &BTreeMap::new(),
            UNSIGNED_PAYLOAD,
            Utc::now(),
        );

        let request = Self::apply_headers(self.client.delete(self.object_url(storage_id)), &headers);

        match request.send().await {
            // 404 is "already absent", which satisfies idempotent delete
            Ok(response) => response.status().is_success() || response.status().as_u16() == 404,
            Err(e) => {
                error!(error = %e, "s3 delete failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(endpoint: &str) -> S3Config {
        S3Config {
            endpoint: Some(endpoint.to_string()),
            bucket: Some("media".to_string()),
            region: "auto".to_string(),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
        }
    }

    #[test]
    fn test_is_configured_requires_all_credentials() {
        assert!(SignedRestProvider::new(config("https://s3.example.com")).is_configured());

        let mut missing = config("https://s3.example.com");
        missing.secret_access_key = None;
        assert!(!SignedRestProvider::new(missing).is_configured());

        assert!(!SignedRestProvider::new(S3Config::default()).is_configured());
    }

    #[test]
    fn test_path_style_addressing() {
        let provider = SignedRestProvider::new(config("https://s3.example.com/"));
        assert_eq!(
            provider.object_url("a.png"),
            "https://s3.example.com/media/a.png"
        );
        assert_eq!(provider.canonical_uri("a.png"), "/media/a.png");
    }

    #[test]
    fn test_virtual_host_style_addressing() {
        let provider = SignedRestProvider::new(config("https://media.s3.example.com"));
        assert_eq!(
            provider.object_url("a.png"),
            "https://media.s3.example.com/a.png"
        );
        assert_eq!(provider.canonical_uri("a.png"), "/a.png");
    }

    #[test]
    fn test_sha256_hex_empty_input() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case_1() {
        let key = [0x0bu8; 20];
        let out = hmac_sha256(&key, b"Hi There");
        assert_eq!(
            hex::encode(out),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_sign_request_shape() {
        let provider = SignedRestProvider::new(config("https://s3.example.com:9000"));
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let headers = provider.sign_request("GET", "/media/a.png", &BTreeMap::new(), UNSIGNED_PAYLOAD, now);

        assert_eq!(headers["host"], "s3.example.com:9000");
        assert_eq!(headers["x-amz-date"], "20240601T120000Z");
        assert_eq!(headers["x-amz-content-sha256"], UNSIGNED_PAYLOAD);

        let auth = &headers["authorization"];
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240601/auto/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert!(auth.contains("Signature="));
    }

    #[test]
    fn test_signature_is_deterministic_for_fixed_time() {
        let provider = SignedRestProvider::new(config("https://s3.example.com"));
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let a = provider.sign_request("PUT", "/media/a.png", &BTreeMap::new(), "abc123", now);
        let b = provider.sign_request("PUT", "/media/a.png", &BTreeMap::new(), "abc123", now);
        assert_eq!(a["authorization"], b["authorization"]);
    }
}
