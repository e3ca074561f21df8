use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::metadata::{FileMetadata, MetadataStore, MirrorStatus, StorageInfo};
use crate::provider::{ProviderKind, ReadRequest, UploadFile, UploadOptions, UploadResult};
use crate::registry::ProviderRegistry;
use crate::router::SmartRouter;

/// Orchestrates an upload across the primary backend and its mirrors
///
/// The primary write is synchronous and authoritative: if it fails the
/// whole upload fails and no mirror is attempted. Mirror replication is
/// fire-and-forget by default; one background task works through the
/// mirror list sequentially and patches the file's storage record as each
/// copy settles, so the record has a single writer after creation.
pub struct RedundancyManager {
    registry: Arc<ProviderRegistry>,
    router: SmartRouter,
    store: Arc<dyn MetadataStore>,
}

impl RedundancyManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        router: SmartRouter,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            registry,
            router,
            store,
        }
    }

    /// Upload a file to the routed primary and schedule mirror copies
    #[instrument(skip(self, file, options), fields(file_name = %file.file_name, size = file.size()))]
    pub async fn upload(&self, file: UploadFile, options: UploadOptions) -> UploadResult {
        let primary_name = self.router.select_storage(&file);
        let provider = self.registry.get_by_name(&primary_name);

        let mut result = provider.upload(&file, &options).await;
        if !result.success {
            metrics::counter!("storage.uploads.failed").increment(1);
            error!(
                provider = %provider.name(),
                error = result.error.as_deref().unwrap_or("unknown"),
                "primary upload failed"
            );
            return result;
        }
        metrics::counter!("storage.uploads.succeeded").increment(1);

        let primary_id = result
            .metadata
            .as_ref()
            .map(|m| m.storage_id.clone())
            .unwrap_or_else(|| result.file_id.clone());

        let mut storage = StorageInfo::new(provider.name(), primary_id);

        let mirrors = self.resolve_mirrors(provider.name());

        if mirrors.is_empty() {
            self.persist_record(&result.file_id, &file, &options, storage.clone())
                .await;
            result.storage = Some(storage);
            return result;
        }

        if self.router.is_async_mirror() {
            // Seed pending entries so readers can watch replication settle
            for &mirror in &mirrors {
                storage.upsert_mirror(MirrorStatus::pending(mirror));
            }
            self.persist_record(&result.file_id, &file, &options, storage.clone())
                .await;

            let registry = Arc::clone(&self.registry);
            let store = Arc::clone(&self.store);
            let file_id = result.file_id.clone();
            let task_file = file.clone();
            let task_options = options.clone();
            tokio::spawn(async move {
                replicate_mirrors(registry, store, file_id, task_file, task_options, mirrors).await;
            });
        } else {
            // Synchronous redundancy: mirrors settle before we answer
            for &mirror in &mirrors {
                let status =
                    upload_to_mirror(&self.registry, mirror, &file, &options).await;
                storage.upsert_mirror(status);
            }
            self.persist_record(&result.file_id, &file, &options, storage.clone())
                .await;
        }

        result.storage = Some(storage);
        result
    }

    /// Re-replicate a single mirror copy
    ///
    /// The seam for a future reconciliation job over `failed` mirrors; no
    /// scheduler lives at this layer.
    #[instrument(skip(self))]
    pub async fn sync_mirror(&self, file_id: &str, mirror: ProviderKind) -> Result<MirrorStatus> {
        let metadata = self
            .store
            .get(file_id)
            .await?
            .with_context(|| format!("no metadata record for {file_id}"))?;

        let Some(storage) = metadata.storage.as_ref() else {
            bail!("file {file_id} has no storage record");
        };

        let primary = self.registry.get(Some(storage.primary));
        let response = primary
            .get_file(&storage.primary_id, &ReadRequest::default())
            .await;

        let Some(body) = response.body.filter(|_| response.status.is_success()) else {
            bail!(
                "primary {} did not return the file for re-sync (status {})",
                storage.primary,
                response.status
            );
        };

        let file = UploadFile::new(body, metadata.file_name.clone(), metadata.content_type.clone());
        let status = upload_to_mirror(&self.registry, mirror, &file, &UploadOptions::default()).await;

        update_mirror_status(&self.store, file_id, status.clone()).await;
        Ok(status)
    }

    /// Mirror names from the router, parsed strictly
    ///
    /// A mirror that equals the primary would only duplicate the copy we
    /// already confirmed, so it is skipped.
    fn resolve_mirrors(&self, primary: ProviderKind) -> Vec<ProviderKind> {
        self.router
            .mirrors()
            .iter()
            .filter_map(|name| match name.parse::<ProviderKind>() {
                Ok(kind) if kind == primary => {
                    debug!(mirror = %kind, "mirror equals primary, skipping");
                    None
                }
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!(%e, "ignoring unknown mirror provider");
                    None
                }
            })
            .collect()
    }

    async fn persist_record(
        &self,
        file_id: &str,
        file: &UploadFile,
        options: &UploadOptions,
        storage: StorageInfo,
    ) {
        let record = FileMetadata {
            file_name: options.effective_file_name(file).to_string(),
            file_size: file.size(),
            content_type: options.effective_content_type(file).to_string(),
            uploaded_at: Utc::now(),
            storage: Some(storage),
        };

        if let Err(e) = self.store.put(file_id, record).await {
            // The copy exists even if the record write failed; reads fall
            // back to the static chain
            error!(error = %e, file_id = %file_id, "failed to persist storage record");
        }
    }
}

/// Upload one mirror copy and describe the outcome
async fn upload_to_mirror(
    registry: &ProviderRegistry,
    mirror: ProviderKind,
    file: &UploadFile,
    options: &UploadOptions,
) -> MirrorStatus {
    let provider = registry.get(Some(mirror));

    // The registry may have substituted the fallback for an unconfigured
    // mirror; replicating to a different backend than asked would corrupt
    // the record
    if provider.name() != mirror {
        metrics::counter!("storage.mirrors.failed").increment(1);
        return MirrorStatus::failed(mirror, "mirror provider not configured".to_string());
    }

    let result = provider.upload(file, options).await;
    if result.success {
        metrics::counter!("storage.mirrors.synced").increment(1);
        let id = result
            .metadata
            .map(|m| m.storage_id)
            .unwrap_or(result.file_id);
        MirrorStatus::synced(mirror, id)
    } else {
        metrics::counter!("storage.mirrors.failed").increment(1);
        MirrorStatus::failed(
            mirror,
            result.error.unwrap_or_else(|| "upload failed".to_string()),
        )
    }
}

/// Background replication for one upload
///
/// Runs the mirror list sequentially so all record updates for a file
/// come from a single task; nothing here can fail the already-answered
/// request, every error is logged and recorded instead.
async fn replicate_mirrors(
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn MetadataStore>,
    file_id: String,
    file: UploadFile,
    options: UploadOptions,
    mirrors: Vec<ProviderKind>,
) {
    for mirror in mirrors {
        let status = upload_to_mirror(&registry, mirror, &file, &options).await;

        match status.status {
            crate::metadata::MirrorState::Synced => {
                info!(file_id = %file_id, mirror = %mirror, "mirror copy synced")
            }
            _ => warn!(
                file_id = %file_id,
                mirror = %mirror,
                error = status.error.as_deref().unwrap_or("unknown"),
                "mirror copy failed"
            ),
        }

        update_mirror_status(&store, &file_id, status).await;
    }
}

/// Read-modify-write of one mirror entry, find-or-append by provider
async fn update_mirror_status(store: &Arc<dyn MetadataStore>, file_id: &str, status: MirrorStatus) {
    let record = match store.get(file_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(file_id = %file_id, "storage record vanished before mirror update");
            return;
        }
        Err(e) => {
            error!(error = %e, file_id = %file_id, "failed to read storage record");
            return;
        }
    };

    let mut record = record;
    let storage = record
        .storage
        .get_or_insert_with(|| StorageInfo::new(status.provider, file_id.to_string()));
    storage.upsert_mirror(status);

    if let Err(e) = store.put(file_id, record).await {
        error!(error = %e, file_id = %file_id, "failed to update mirror status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RoutingConfig, StorageMode};
    use crate::metadata::{InMemoryMetadataStore, MirrorState};
    use crate::test_util::FakeProvider;
    use std::time::Duration;

    fn routing(mode: StorageMode, primary: &str, mirrors: &str, mirror_async: bool) -> RoutingConfig {
        RoutingConfig {
            mode,
            primary: Some(primary.to_string()),
            mirrors: mirrors.to_string(),
            mirror_async,
            ..Default::default()
        }
    }

    struct Harness {
        manager: RedundancyManager,
        store: Arc<InMemoryMetadataStore>,
        telegram: Arc<FakeProvider>,
        bucket: Arc<FakeProvider>,
        s3: Arc<FakeProvider>,
    }

    fn harness_with(routing: RoutingConfig, bucket: FakeProvider, s3: FakeProvider) -> Harness {
        let registry = Arc::new(ProviderRegistry::new(Config::default()));
        let telegram = Arc::new(FakeProvider::new(ProviderKind::Telegram));
        let bucket = Arc::new(bucket);
        let s3 = Arc::new(s3);
        registry.inject(ProviderKind::Telegram, telegram.clone());
        registry.inject(ProviderKind::Bucket, bucket.clone());
        registry.inject(ProviderKind::S3, s3.clone());

        let store = Arc::new(InMemoryMetadataStore::new());
        let manager = RedundancyManager::new(
            registry,
            SmartRouter::new(&routing),
            store.clone() as Arc<dyn MetadataStore>,
        );

        Harness {
            manager,
            store,
            telegram,
            bucket,
            s3,
        }
    }

    fn upload_file() -> UploadFile {
        UploadFile::new(&b"picture bytes"[..], "photo.jpg", "image/jpeg")
    }

    async fn settled_record(store: &InMemoryMetadataStore, file_id: &str) -> FileMetadata {
        // Background replication has no completion handle by design; poll
        for _ in 0..100 {
            if let Some(record) = store.get(file_id).await.unwrap() {
                let storage = record.storage.as_ref().unwrap();
                if storage
                    .mirrors
                    .iter()
                    .all(|m| m.status != MirrorState::Pending)
                {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mirrors never settled for {file_id}");
    }

    #[tokio::test]
    async fn test_upload_without_mirrors_persists_primary_record() {
        let h = harness_with(
            routing(StorageMode::Single, "telegram", "", true),
            FakeProvider::new(ProviderKind::Bucket),
            FakeProvider::new(ProviderKind::S3),
        );

        let result = h.manager.upload(upload_file(), UploadOptions::default()).await;
        assert!(result.success);

        let record = h.store.get(&result.file_id).await.unwrap().unwrap();
        let storage = record.storage.unwrap();
        assert_eq!(storage.primary, ProviderKind::Telegram);
        assert!(storage.mirrors.is_empty());
        assert!(h.telegram.has_object(&storage.primary_id));
    }

    #[tokio::test]
    async fn test_primary_failure_aborts_without_touching_mirrors() {
        let registry = Arc::new(ProviderRegistry::new(Config::default()));
        let telegram = Arc::new(FakeProvider::failing_uploads(ProviderKind::Telegram));
        let bucket = Arc::new(FakeProvider::new(ProviderKind::Bucket));
        registry.inject(ProviderKind::Telegram, telegram.clone());
        registry.inject(ProviderKind::Bucket, bucket.clone());

        let store = Arc::new(InMemoryMetadataStore::new());
        let manager = RedundancyManager::new(
            registry,
            SmartRouter::new(&routing(StorageMode::Redundant, "telegram", "bucket", true)),
            store.clone() as Arc<dyn MetadataStore>,
        );

        let result = manager.upload(upload_file(), UploadOptions::default()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        // No mirror attempt after a failed primary
        assert_eq!(bucket.upload_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_mirrors_settle_with_mixed_outcomes() {
        let h = harness_with(
            routing(StorageMode::Redundant, "telegram", "bucket,s3", true),
            FakeProvider::new(ProviderKind::Bucket),
            FakeProvider::failing_uploads(ProviderKind::S3),
        );

        let result = h.manager.upload(upload_file(), UploadOptions::default()).await;
        assert!(result.success);

        // The response does not wait for replication
        let initial = result.storage.unwrap();
        assert_eq!(initial.mirrors.len(), 2);
        assert!(initial.mirrors.iter().all(|m| m.status == MirrorState::Pending));

        let record = settled_record(&h.store, &result.file_id).await;
        let storage = record.storage.unwrap();
        assert_eq!(storage.mirrors.len(), 2);

        let bucket = storage.mirror(ProviderKind::Bucket).unwrap();
        assert_eq!(bucket.status, MirrorState::Synced);
        assert!(h.bucket.has_object(bucket.id.as_deref().unwrap()));

        let s3 = storage.mirror(ProviderKind::S3).unwrap();
        assert_eq!(s3.status, MirrorState::Failed);
        assert!(s3.error.is_some());
        assert!(s3.id.is_none());
        assert_eq!(h.s3.upload_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_mirror_mode_folds_results_into_response() {
        let h = harness_with(
            routing(StorageMode::Redundant, "telegram", "bucket", false),
            FakeProvider::new(ProviderKind::Bucket),
            FakeProvider::new(ProviderKind::S3),
        );

        let result = h.manager.upload(upload_file(), UploadOptions::default()).await;
        assert!(result.success);

        let storage = result.storage.unwrap();
        assert_eq!(storage.mirrors.len(), 1);
        assert_eq!(storage.mirrors[0].status, MirrorState::Synced);

        // Persisted record already matches, no background task involved
        let record = h.store.get(&result.file_id).await.unwrap().unwrap();
        assert_eq!(
            record.storage.unwrap().mirror(ProviderKind::Bucket).unwrap().status,
            MirrorState::Synced
        );
    }

    #[tokio::test]
    async fn test_mirror_equal_to_primary_is_skipped() {
        let h = harness_with(
            routing(StorageMode::Redundant, "telegram", "telegram,bucket", false),
            FakeProvider::new(ProviderKind::Bucket),
            FakeProvider::new(ProviderKind::S3),
        );

        let result = h.manager.upload(upload_file(), UploadOptions::default()).await;
        let storage = result.storage.unwrap();
        assert_eq!(storage.mirrors.len(), 1);
        assert_eq!(storage.mirrors[0].provider, ProviderKind::Bucket);
    }

    #[tokio::test]
    async fn test_sync_mirror_primitive_replicates_one_copy() {
        let h = harness_with(
            routing(StorageMode::Redundant, "telegram", "", true),
            FakeProvider::new(ProviderKind::Bucket),
            FakeProvider::new(ProviderKind::S3),
        );

        let result = h.manager.upload(upload_file(), UploadOptions::default()).await;
        assert!(result.success);

        let status = h
            .manager
            .sync_mirror(&result.file_id, ProviderKind::Bucket)
            .await
            .unwrap();
        assert_eq!(status.status, MirrorState::Synced);
        assert!(h.bucket.has_object(status.id.as_deref().unwrap()));

        let record = h.store.get(&result.file_id).await.unwrap().unwrap();
        let storage = record.storage.unwrap();
        assert_eq!(storage.mirror(ProviderKind::Bucket).unwrap().status, MirrorState::Synced);
    }

    #[tokio::test]
    async fn test_sync_mirror_unknown_file_errors() {
        let h = harness_with(
            routing(StorageMode::Single, "telegram", "", true),
            FakeProvider::new(ProviderKind::Bucket),
            FakeProvider::new(ProviderKind::S3),
        );
        assert!(h.manager.sync_mirror("missing", ProviderKind::Bucket).await.is_err());
    }
}
