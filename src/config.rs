use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Telegram (chat-relay) backend configuration
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Object-bucket backend configuration
    #[serde(default)]
    pub bucket: BucketConfig,
    /// Signed-REST (S3-protocol) backend configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Upload routing configuration
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Read fallback configuration
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Telegram Bot API backend configuration
///
/// Files are relayed to a channel through a bot and retrieved back
/// via the Bot API's `getFile` indirection.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    pub bot_token: Option<String>,
    /// Target chat/channel ID
    pub chat_id: Option<String>,
    /// Bot API base URL (override for self-hosted Bot API servers)
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

/// Object-bucket backend configuration (AWS SDK client)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BucketConfig {
    /// Bucket name
    pub bucket: Option<String>,
    /// Region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Cache-Control value written on uploaded objects
    #[serde(default = "default_cache_control")]
    pub cache_control: String,
}

/// Signed-REST backend configuration
///
/// Speaks the S3 REST protocol with hand-rolled SigV4 signing, so it
/// works against any compatible endpoint without an SDK client.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3Config {
    /// Endpoint URL (e.g. <https://s3.example.com>)
    pub endpoint: Option<String>,
    /// Bucket name
    pub bucket: Option<String>,
    /// Region used in the credential scope
    #[serde(default = "default_s3_region")]
    pub region: String,
    /// Access key ID
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
}

/// Storage routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Always use the configured primary provider
    #[default]
    Single,
    /// Evaluate routing rules per upload
    Smart,
    /// Primary plus mirror replication
    Redundant,
}

/// Upload routing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Routing mode
    #[serde(default)]
    pub mode: StorageMode,
    /// Default provider when nothing more specific applies
    pub provider: Option<String>,
    /// Primary provider for single/redundant modes (falls back to `provider`)
    pub primary: Option<String>,
    /// Routing rules as a JSON array (smart mode)
    pub rules: Option<String>,
    /// Comma-separated mirror providers (redundant mode)
    #[serde(default)]
    pub mirrors: String,
    /// Replicate to mirrors in the background instead of inline
    #[serde(default = "default_true")]
    pub mirror_async: bool,
}

/// Read fallback configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    /// Walk the candidate chain on reads
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Comma-separated static chain for files without storage metadata
    #[serde(default = "default_fallback_chain")]
    pub chain: String,
    /// Per-candidate read timeout in milliseconds
    #[serde(default = "default_fallback_timeout_ms")]
    pub timeout_ms: u64,
}

/// API configuration for the upload/serve endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "filehost-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_cache_control() -> String {
    "public, max-age=31536000".to_string()
}

fn default_fallback_chain() -> String {
    "bucket,s3,telegram".to_string()
}

fn default_fallback_timeout_ms() -> u64 {
    3000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "filehost-storage")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/filehost/storage").required(false))
            // Override with environment variables
            // STORAGE__TELEGRAM__BOT_TOKEN -> telegram.bot_token
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the per-candidate fallback read timeout as Duration
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback.timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Single,
            provider: None,
            primary: None,
            rules: None,
            mirrors: String::new(),
            mirror_async: true,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chain: default_fallback_chain(),
            timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.routing.mode, StorageMode::Single);
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback.timeout_ms, 3000);
        assert_eq!(config.fallback.chain, "bucket,s3,telegram");
    }

    #[test]
    fn test_mirror_async_defaults_on() {
        let routing: RoutingConfig = serde_json::from_str("{}").unwrap();
        assert!(routing.mirror_async);
        assert_eq!(routing.mirrors, "");
    }
}
