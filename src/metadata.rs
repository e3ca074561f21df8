use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::provider::ProviderKind;

/// Sync state of one mirror copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorState {
    /// Replication scheduled but not finished
    Pending,
    /// Copy confirmed on the mirror backend
    Synced,
    /// Replication gave up; terminal until an external re-sync
    Failed,
}

/// One mirror entry inside a file's storage record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorStatus {
    /// Mirror backend
    pub provider: ProviderKind,
    /// Backend-specific id on the mirror, once synced
    pub id: Option<String>,
    pub status: MirrorState,
    /// When the entry last changed state
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MirrorStatus {
    pub fn pending(provider: ProviderKind) -> Self {
        Self {
            provider,
            id: None,
            status: MirrorState::Pending,
            synced_at: None,
            error: None,
        }
    }

    pub fn synced(provider: ProviderKind, id: String) -> Self {
        Self {
            provider,
            id: Some(id),
            status: MirrorState::Synced,
            synced_at: Some(Utc::now()),
            error: None,
        }
    }

    pub fn failed(provider: ProviderKind, error: String) -> Self {
        Self {
            provider,
            id: None,
            status: MirrorState::Failed,
            synced_at: Some(Utc::now()),
            error: Some(error),
        }
    }
}

/// Which backends hold a copy of a file and under what ids
///
/// `primary` is confirmed synchronously before the upload response is
/// returned; mirror entries are patched in place (by provider, never
/// duplicated) as replication settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub primary: ProviderKind,
    /// Backend-specific id on the primary (may differ from the file id)
    pub primary_id: String,
    #[serde(default)]
    pub mirrors: Vec<MirrorStatus>,
}

impl StorageInfo {
    pub fn new(primary: ProviderKind, primary_id: String) -> Self {
        Self {
            primary,
            primary_id,
            mirrors: Vec::new(),
        }
    }

    /// Find-or-append update of the entry for `status.provider`
    pub fn upsert_mirror(&mut self, status: MirrorStatus) {
        match self.mirrors.iter_mut().find(|m| m.provider == status.provider) {
            Some(existing) => *existing = status,
            None => self.mirrors.push(status),
        }
    }

    pub fn mirror(&self, provider: ProviderKind) -> Option<&MirrorStatus> {
        self.mirrors.iter().find(|m| m.provider == provider)
    }
}

/// Metadata record persisted per file in the key-value store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
    /// Absent on records written before multi-backend support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInfo>,
}

/// Key-value store holding one [`FileMetadata`] per file id
///
/// The real deployment binds this to an external KV service; the service
/// only needs get/put/delete over serialized records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, file_id: &str) -> anyhow::Result<Option<FileMetadata>>;

    async fn put(&self, file_id: &str, metadata: FileMetadata) -> anyhow::Result<()>;

    /// Returns whether a record existed
    async fn delete(&self, file_id: &str) -> anyhow::Result<bool>;
}

/// In-memory metadata store
///
/// Default wiring for single-node deployments and the store used by tests.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, FileMetadata>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, file_id: &str) -> anyhow::Result<Option<FileMetadata>> {
        let records = self.records.read().expect("metadata lock poisoned");
        Ok(records.get(file_id).cloned())
    }

    async fn put(&self, file_id: &str, metadata: FileMetadata) -> anyhow::Result<()> {
        let mut records = self.records.write().expect("metadata lock poisoned");
        records.insert(file_id.to_string(), metadata);
        Ok(())
    }

    async fn delete(&self, file_id: &str) -> anyhow::Result<bool> {
        let mut records = self.records.write().expect("metadata lock poisoned");
        Ok(records.remove(file_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FileMetadata {
        FileMetadata {
            file_name: "photo.jpg".to_string(),
            file_size: 1024,
            content_type: "image/jpeg".to_string(),
            uploaded_at: Utc::now(),
            storage: Some(StorageInfo::new(ProviderKind::Telegram, "tg-abc".to_string())),
        }
    }

    #[test]
    fn test_upsert_mirror_never_duplicates() {
        let mut info = StorageInfo::new(ProviderKind::Telegram, "tg-abc".to_string());
        info.upsert_mirror(MirrorStatus::pending(ProviderKind::Bucket));
        info.upsert_mirror(MirrorStatus::synced(ProviderKind::Bucket, "obj-1".to_string()));
        assert_eq!(info.mirrors.len(), 1);
        assert_eq!(info.mirrors[0].status, MirrorState::Synced);
        assert_eq!(info.mirrors[0].id.as_deref(), Some("obj-1"));
    }

    #[test]
    fn test_storage_info_serde_shape() {
        let mut info = StorageInfo::new(ProviderKind::Bucket, "obj-1".to_string());
        info.upsert_mirror(MirrorStatus::failed(ProviderKind::S3, "timeout".to_string()));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["primary"], "bucket");
        assert_eq!(json["mirrors"][0]["status"], "failed");
        assert_eq!(json["mirrors"][0]["error"], "timeout");
    }

    #[test]
    fn test_legacy_record_without_storage_deserializes() {
        let json = r#"{
            "file_name": "old.png",
            "file_size": 10,
            "content_type": "image/png",
            "uploaded_at": "2023-01-01T00:00:00Z"
        }"#;
        let meta: FileMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.storage.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryMetadataStore::new();
        store.put("abc", record()).await.unwrap();
        let fetched = store.get("abc").await.unwrap().unwrap();
        assert_eq!(fetched.file_name, "photo.jpg");
        assert!(store.delete("abc").await.unwrap());
        assert!(!store.delete("abc").await.unwrap());
        assert!(store.get("abc").await.unwrap().is_none());
    }
}
