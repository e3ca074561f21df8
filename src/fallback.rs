use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::FallbackConfig;
use crate::metadata::{FileMetadata, MetadataStore};
use crate::provider::{FileResponse, ProviderKind, ReadRequest};
use crate::registry::ProviderRegistry;
use crate::router::build_fallback_chain;

/// Resolves file reads across the candidate backend chain
///
/// Walks candidates in order with a per-candidate deadline. A slow backend
/// costs at most one timeout interval before the next copy is tried. The
/// caller always gets exactly one response; exhaustion collapses into a
/// single not-found regardless of why individual candidates failed.
pub struct FallbackReader {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn MetadataStore>,
    config: FallbackConfig,
}

impl FallbackReader {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn MetadataStore>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Serve a file, trying each candidate backend until one answers
    #[instrument(skip(self, request))]
    pub async fn get_file(&self, file_id: &str, request: &ReadRequest) -> FileResponse {
        let metadata = match self.store.get(file_id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "metadata lookup failed, serving without storage record");
                None
            }
        };

        if !self.config.enabled {
            let provider = self.registry.provider_for_file(metadata.as_ref());
            let storage_id = resolve_storage_id(metadata.as_ref(), provider.name(), file_id);
            return provider.get_file(&storage_id, request).await;
        }

        let chain = build_fallback_chain(&self.config, metadata.as_ref());
        let deadline = self.read_timeout();

        for name in &chain {
            let kind = match name.parse::<ProviderKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(%e, "skipping unknown provider in fallback chain");
                    continue;
                }
            };

            let provider = self.registry.get(Some(kind));
            if provider.name() != kind {
                // Registry substituted the fallback for an unconfigured
                // candidate; it gets its own slot later in the chain
                debug!(candidate = %kind, "candidate not configured, skipping");
                continue;
            }

            let storage_id = resolve_storage_id(metadata.as_ref(), kind, file_id);

            match timeout(deadline, provider.get_file(&storage_id, request)).await {
                Ok(response) if response.is_usable() => {
                    metrics::counter!("storage.reads.served", "provider" => kind.as_str())
                        .increment(1);
                    debug!(provider = %kind, status = %response.status, "read served");
                    return response;
                }
                Ok(response) => {
                    debug!(
                        provider = %kind,
                        status = %response.status,
                        "candidate could not serve the file"
                    );
                }
                Err(_) => {
                    metrics::counter!("storage.reads.timeout", "provider" => kind.as_str())
                        .increment(1);
                    warn!(provider = %kind, timeout_ms = self.config.timeout_ms, "read timed out");
                }
            }
        }

        metrics::counter!("storage.reads.exhausted").increment(1);
        FileResponse::not_found("File not found in any storage")
    }
}

/// Backend-specific id for a candidate: the recorded primary or mirror id
/// where one exists, otherwise the public file id
fn resolve_storage_id(
    metadata: Option<&FileMetadata>,
    candidate: ProviderKind,
    file_id: &str,
) -> String {
    if let Some(storage) = metadata.and_then(|m| m.storage.as_ref()) {
        if storage.primary == candidate {
            return storage.primary_id.clone();
        }
        if let Some(id) = storage.mirror(candidate).and_then(|m| m.id.clone()) {
            return id;
        }
    }
    file_id.to_string()
}
