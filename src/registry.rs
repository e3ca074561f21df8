use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::config::Config;
use crate::metadata::FileMetadata;
use crate::provider::{ProviderKind, StorageProvider};
use crate::providers::{BucketProvider, SignedRestProvider, TelegramProvider};

/// Hard-coded fallback: the backend needing the least infrastructure to
/// bootstrap
const FALLBACK_PROVIDER: ProviderKind = ProviderKind::Telegram;

/// Configured state of one provider, for diagnostics
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub configured: bool,
}

/// Resolves and caches provider instances
///
/// One instance per kind for the process lifetime. Built explicitly at
/// startup and passed by `Arc` into the router/manager, so tests can
/// substitute fresh registries instead of fighting a module-global.
pub struct ProviderRegistry {
    config: Config,
    cache: RwLock<HashMap<ProviderKind, Arc<dyn StorageProvider>>>,
}

impl ProviderRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn construct(&self, kind: ProviderKind) -> Arc<dyn StorageProvider> {
        match kind {
            ProviderKind::Telegram => Arc::new(TelegramProvider::new(self.config.telegram.clone())),
            ProviderKind::Bucket => Arc::new(BucketProvider::new(self.config.bucket.clone())),
            ProviderKind::S3 => Arc::new(SignedRestProvider::new(self.config.s3.clone())),
        }
    }

    /// Cached instance of one kind, constructing it on first request
    fn instance(&self, kind: ProviderKind) -> Arc<dyn StorageProvider> {
        {
            let cache = self.cache.read().expect("provider cache lock poisoned");
            if let Some(provider) = cache.get(&kind) {
                return Arc::clone(provider);
            }
        }

        let mut cache = self.cache.write().expect("provider cache lock poisoned");
        Arc::clone(
            cache
                .entry(kind)
                .or_insert_with(|| self.construct(kind)),
        )
    }

    /// Default provider type from configuration, if it parses
    fn configured_default(&self) -> Option<ProviderKind> {
        let name = self.config.routing.provider.as_deref()?;
        match name.parse() {
            Ok(kind) => Some(kind),
            Err(e) => {
                warn!(%e, "invalid default storage provider, ignoring");
                None
            }
        }
    }

    /// Resolve a provider: explicit request, else configured default, else
    /// the hard-coded fallback
    ///
    /// A resolved provider that is not configured falls back once; if the
    /// fallback itself is unconfigured it is returned anyway and the
    /// caller sees the resulting upload/read failures.
    pub fn get(&self, requested: Option<ProviderKind>) -> Arc<dyn StorageProvider> {
        let kind = requested
            .or_else(|| self.configured_default())
            .unwrap_or(FALLBACK_PROVIDER);

        let provider = self.instance(kind);

        if !provider.is_configured() {
            warn!(provider = %kind, "storage provider is not properly configured");
            if kind != FALLBACK_PROVIDER {
                warn!(fallback = %FALLBACK_PROVIDER, "falling back to default storage");
                return self.instance(FALLBACK_PROVIDER);
            }
        }

        provider
    }

    /// Resolve by name, tolerating unknown names with a warning
    pub fn get_by_name(&self, name: &str) -> Arc<dyn StorageProvider> {
        match name.parse::<ProviderKind>() {
            Ok(kind) => self.get(Some(kind)),
            Err(e) => {
                warn!(%e, "unknown storage provider, using fallback");
                self.get(Some(FALLBACK_PROVIDER))
            }
        }
    }

    /// Provider holding an existing file's primary copy
    ///
    /// Records written before multi-backend support have no storage info
    /// and resolve to the original single backend.
    pub fn provider_for_file(&self, metadata: Option<&FileMetadata>) -> Arc<dyn StorageProvider> {
        match metadata.and_then(|m| m.storage.as_ref()) {
            Some(storage) => self.get(Some(storage.primary)),
            None => self.get(Some(FALLBACK_PROVIDER)),
        }
    }

    /// Default provider for requests carrying no routing hint
    pub fn default_provider(&self) -> Arc<dyn StorageProvider> {
        self.get(None)
    }

    /// Pre-seed the cache with a substitute provider
    #[cfg(test)]
    pub(crate) fn inject(&self, kind: ProviderKind, provider: Arc<dyn StorageProvider>) {
        let mut cache = self.cache.write().expect("provider cache lock poisoned");
        cache.insert(kind, provider);
    }

    /// Configured state of every known provider
    pub fn list_available(&self) -> Vec<ProviderStatus> {
        ProviderKind::ALL
            .iter()
            .map(|&kind| ProviderStatus {
                kind,
                configured: self.instance(kind).is_configured(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, TelegramConfig};
    use crate::metadata::StorageInfo;
    use chrono::Utc;

    fn config_with_bucket() -> Config {
        Config {
            bucket: BucketConfig {
                bucket: Some("files".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config_with_telegram_and_bucket() -> Config {
        let mut config = config_with_bucket();
        config.telegram = TelegramConfig {
            bot_token: Some("token".to_string()),
            chat_id: Some("chat".to_string()),
            api_base: "https://api.telegram.org".to_string(),
        };
        config
    }

    #[test]
    fn test_instances_are_cached_per_kind() {
        let registry = ProviderRegistry::new(Config::default());
        let a = registry.instance(ProviderKind::Bucket);
        let b = registry.instance(ProviderKind::Bucket);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_default_resolution_is_telegram() {
        let registry = ProviderRegistry::new(Config::default());
        assert_eq!(registry.get(None).name(), ProviderKind::Telegram);
    }

    #[test]
    fn test_configured_default_wins_over_fallback() {
        let mut config = config_with_bucket();
        config.routing.provider = Some("bucket".to_string());
        let registry = ProviderRegistry::new(config);
        assert_eq!(registry.get(None).name(), ProviderKind::Bucket);
    }

    #[test]
    fn test_unconfigured_provider_falls_back_to_telegram() {
        // S3 has no credentials here, telegram does
        let registry = ProviderRegistry::new(config_with_telegram_and_bucket());
        assert_eq!(registry.get(Some(ProviderKind::S3)).name(), ProviderKind::Telegram);
    }

    #[test]
    fn test_unconfigured_fallback_is_returned_anyway() {
        let registry = ProviderRegistry::new(Config::default());
        let provider = registry.get(Some(ProviderKind::Telegram));
        assert_eq!(provider.name(), ProviderKind::Telegram);
        assert!(!provider.is_configured());
    }

    #[test]
    fn test_unknown_name_resolves_to_fallback() {
        let registry = ProviderRegistry::new(Config::default());
        assert_eq!(registry.get_by_name("gdrive").name(), ProviderKind::Telegram);
    }

    #[test]
    fn test_provider_for_file_honors_recorded_primary() {
        let registry = ProviderRegistry::new(config_with_bucket());
        let meta = FileMetadata {
            file_name: "a.png".to_string(),
            file_size: 10,
            content_type: "image/png".to_string(),
            uploaded_at: Utc::now(),
            storage: Some(StorageInfo::new(ProviderKind::Bucket, "obj-1".to_string())),
        };
        assert_eq!(
            registry.provider_for_file(Some(&meta)).name(),
            ProviderKind::Bucket
        );
        // Legacy records route to the original single backend
        assert_eq!(
            registry.provider_for_file(None).name(),
            ProviderKind::Telegram
        );
    }

    #[test]
    fn test_list_available_reports_configured_state() {
        let statuses = ProviderRegistry::new(config_with_bucket()).list_available();
        assert_eq!(statuses.len(), 3);
        let bucket = statuses.iter().find(|s| s.kind == ProviderKind::Bucket).unwrap();
        assert!(bucket.configured);
        let s3 = statuses.iter().find(|s| s.kind == ProviderKind::S3).unwrap();
        assert!(!s3.configured);
    }
}
