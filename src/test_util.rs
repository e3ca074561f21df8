//! Fake providers shared by the orchestration tests

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::provider::{
    FileResponse, ProviderKind, ProviderMetadata, ReadRequest, StorageProvider, UploadFile,
    UploadOptions, UploadResult,
};

/// In-memory provider with scriptable failure modes
pub struct FakeProvider {
    kind: ProviderKind,
    fail_uploads: bool,
    read_delay: Option<Duration>,
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    counter: AtomicU64,
    pub upload_calls: AtomicU64,
    pub read_calls: AtomicU64,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            fail_uploads: false,
            read_delay: None,
            objects: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            upload_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
        }
    }

    pub fn failing_uploads(kind: ProviderKind) -> Self {
        Self {
            fail_uploads: true,
            ..Self::new(kind)
        }
    }

    /// Simulates a degraded backend whose reads hang
    pub fn slow_reads(kind: ProviderKind, delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::new(kind)
        }
    }

    pub fn insert_object(&self, id: &str, data: impl Into<Bytes>, content_type: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(id.to_string(), (data.into(), content_type.to_string()));
    }

    pub fn has_object(&self, id: &str) -> bool {
        self.objects.lock().unwrap().contains_key(id)
    }
}

#[async_trait]
impl StorageProvider for FakeProvider {
    fn name(&self) -> ProviderKind {
        self.kind
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn upload(&self, file: &UploadFile, options: &UploadOptions) -> UploadResult {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_uploads {
            return UploadResult::failure(format!("{} upload failed", self.kind));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let storage_id = format!("{}-{}", self.kind, n);
        let content_type = options.effective_content_type(file).to_string();
        self.objects
            .lock()
            .unwrap()
            .insert(storage_id.clone(), (file.data.clone(), content_type.clone()));

        UploadResult::ok(
            storage_id.clone(),
            ProviderMetadata {
                storage_provider: self.kind,
                storage_id,
                file_name: options.effective_file_name(file).to_string(),
                file_size: file.size(),
                content_type,
            },
        )
    }

    async fn get_file(&self, storage_id: &str, _request: &ReadRequest) -> FileResponse {
        self.read_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }

        let object = self.objects.lock().unwrap().get(storage_id).cloned();
        match object {
            Some((data, content_type)) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    headers.insert(header::CONTENT_TYPE, value);
                }
                FileResponse::ok(data, headers)
            }
            None => FileResponse::not_found("File not found"),
        }
    }

    async fn delete_file(&self, storage_id: &str) -> bool {
        self.objects.lock().unwrap().remove(storage_id);
        true
    }
}
