use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the publisher service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Metadata database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Publish retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Photo/text ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,
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

/// Which object storage backend holds photos and generated artifacts
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Local,
    S3,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend selector
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// Root directory for the local backend
    #[serde(default = "default_local_root")]
    pub local_root: String,
    /// Public base URL prepended to object keys (CDN or static host)
    pub public_base_url: Option<String>,
    /// S3 settings, required when `backend = "s3"`
    pub s3: Option<S3Config>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for card assets
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. When absent the in-memory repository is used.
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Publish retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Shared secret the external scheduler presents as a bearer token
    pub secret: Option<String>,
    /// Maximum cards claimed per batch invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Attempt count at which automatic retries stop
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Upper bound on any retry delay, in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// How far a claim pushes next-retry-due forward while the batch runs
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Cards regenerated concurrently within one batch
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
}

/// Ingestion configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Photos wider than this are downscaled
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// JPEG quality for the normalized photo (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Character bound for text panels
    #[serde(default = "default_text_panel_max_chars")]
    pub text_panel_max_chars: usize,
}

/// API configuration
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
    /// Largest accepted photo upload in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "keepsake-publisher".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_local_root() -> String {
    "./data/objects".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> u32 {
    20
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_delay_secs() -> u64 {
    5 * 60
}

fn default_max_delay_secs() -> u64 {
    12 * 60 * 60
}

fn default_claim_lease_secs() -> u64 {
    10 * 60
}

fn default_batch_concurrency() -> usize {
    4
}

fn default_max_width() -> u32 {
    800
}

fn default_jpeg_quality() -> u8 {
    82
}

fn default_text_panel_max_chars() -> usize {
    500
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "keepsake-publisher")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("storage.backend", "local")?
            // Add config file if present
            .add_source(config::File::with_name("config/publisher").required(false))
            .add_source(config::File::with_name("/etc/keepsake/publisher").required(false))
            // Override with environment variables
            // PUBLISHER__RETRY__SECRET -> retry.secret
            .add_source(
                config::Environment::with_prefix("PUBLISHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.base_delay_secs as i64)
    }

    pub fn max_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_delay_secs as i64)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
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

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            secret: None,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            claim_lease_secs: default_claim_lease_secs(),
            concurrency: default_batch_concurrency(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            jpeg_quality: default_jpeg_quality(),
            text_panel_max_chars: default_text_panel_max_chars(),
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
        let retry = RetryConfig::default();
        assert_eq!(retry.batch_size, 20);
        assert_eq!(retry.max_attempts, 8);
        assert_eq!(retry.base_delay(), chrono::Duration::minutes(5));
        assert_eq!(retry.max_delay(), chrono::Duration::hours(12));
        assert!(retry.secret.is_none());

        let ingest = IngestConfig::default();
        assert_eq!(ingest.max_width, 800);
        assert_eq!(ingest.text_panel_max_chars, 500);

        let database = DatabaseConfig::default();
        assert!(database.url.is_none());
        assert_eq!(database.connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_storage_backend_deserializes_snake_case() {
        let backend: StorageBackend = serde_json::from_str("\"s3\"").unwrap();
        assert_eq!(backend, StorageBackend::S3);
        let backend: StorageBackend = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(backend, StorageBackend::Local);
    }
}
