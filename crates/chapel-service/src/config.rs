//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chapel_core::{InterceptorConfig, MaintenancePolicy, PrecacheManifest};
use chapel_types::SyncConfig;

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Sync schedule and gates.
    pub sync: SyncConfig,
    /// Network interceptor behavior.
    pub interceptor: InterceptorConfig,
    /// Cache maintenance.
    pub cache: CacheConfig,
    /// Shell assets fetched at install.
    pub precache: PrecacheManifest,
    /// In-process background triggers.
    pub background: BackgroundConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, reporting every problem at once.
    ///
    /// ```
    /// use chapel_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(validate_sync(&self.sync));
        errors.extend(validate_interceptor(&self.interceptor));
        errors.extend(self.cache.validate());
        errors.extend(validate_precache(&self.precache));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Interceptor settings with the origin defaulting to the backend URL.
    pub fn interceptor_config(&self) -> InterceptorConfig {
        let mut interceptor = self.interceptor.clone();
        if interceptor.origin.is_none() {
            interceptor.origin = Some(self.server.base_url.trim_end_matches('/').to_string());
        }
        interceptor
    }
}

/// Backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Backend origin (e.g., "https://app.example.org").
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Path probed to decide whether the backend is reachable.
    pub health_path: String,
    /// Seconds between connectivity probes.
    pub probe_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            request_timeout_secs: 10,
            health_path: "/api/health".to_string(),
            probe_interval_secs: 30,
        }
    }
}

/// Minimum connectivity probe interval in seconds.
pub const MIN_PROBE_INTERVAL: u64 = 5;
/// Maximum request timeout in seconds.
pub const MAX_REQUEST_TIMEOUT: u64 = 300;
/// Maximum cache entry age in seconds (ten years).
pub const MAX_CACHE_AGE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !is_http_url(&self.base_url) {
            errors.push(ValidationError::new(
                "server.base_url",
                format!(
                    "invalid URL '{}': must start with http:// or https://",
                    self.base_url
                ),
            ));
        }

        if self.request_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "server.request_timeout_secs",
                "request timeout cannot be 0",
            ));
        } else if self.request_timeout_secs > MAX_REQUEST_TIMEOUT {
            errors.push(ValidationError::new(
                "server.request_timeout_secs",
                format!(
                    "request timeout {} is too long (maximum {} seconds)",
                    self.request_timeout_secs, MAX_REQUEST_TIMEOUT
                ),
            ));
        }

        if !self.health_path.starts_with('/') {
            errors.push(ValidationError::new(
                "server.health_path",
                format!("health path '{}' must start with '/'", self.health_path),
            ));
        }

        if self.probe_interval_secs < MIN_PROBE_INTERVAL {
            errors.push(ValidationError::new(
                "server.probe_interval_secs",
                format!(
                    "probe interval {} is too short (minimum {} seconds)",
                    self.probe_interval_secs, MIN_PROBE_INTERVAL
                ),
            ));
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: chapel_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }

        errors
    }
}

/// Cache maintenance configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size above which stale entries are evicted.
    pub max_size_bytes: u64,
    /// Age at which an entry counts as stale.
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let policy = MaintenancePolicy::default();
        Self {
            max_size_bytes: policy.max_size_bytes,
            max_age_secs: policy.max_age.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> MaintenancePolicy {
        MaintenancePolicy {
            max_size_bytes: self.max_size_bytes,
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.max_size_bytes == 0 {
            errors.push(ValidationError::new(
                "cache.max_size_bytes",
                "cache size limit cannot be 0",
            ));
        }
        if self.max_age_secs > MAX_CACHE_AGE_SECS {
            errors.push(ValidationError::new(
                "cache.max_age_secs",
                format!("cache max age cannot exceed {} seconds", MAX_CACHE_AGE_SECS),
            ));
        }
        errors
    }
}

/// In-process background trigger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Run background triggers inside the daemon.
    pub enabled: bool,
    /// Seconds between a registration and its delivery.
    pub delay_secs: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 5,
        }
    }
}

impl BackgroundConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn validate_sync(sync: &SyncConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if sync.interval_secs == 0 {
        errors.push(ValidationError::new(
            "sync.interval_secs",
            "sync interval cannot be 0",
        ));
    }
    if sync.battery_threshold > 100 {
        errors.push(ValidationError::new(
            "sync.battery_threshold",
            format!(
                "battery threshold {} is not a percentage (0-100)",
                sync.battery_threshold
            ),
        ));
    }
    if sync.max_retries == 0 {
        errors.push(ValidationError::new(
            "sync.max_retries",
            "max retries must be at least 1",
        ));
    }

    errors
}

fn validate_interceptor(interceptor: &InterceptorConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !interceptor.api_prefix.starts_with('/') {
        errors.push(ValidationError::new(
            "interceptor.api_prefix",
            format!("API prefix '{}' must start with '/'", interceptor.api_prefix),
        ));
    }
    if let Some(origin) = &interceptor.origin
        && !is_http_url(origin)
    {
        errors.push(ValidationError::new(
            "interceptor.origin",
            format!("invalid origin '{}': must start with http:// or https://", origin),
        ));
    }
    for (i, endpoint) in interceptor.excluded_endpoints.iter().enumerate() {
        if !endpoint.starts_with('/') {
            errors.push(ValidationError::new(
                format!("interceptor.excluded_endpoints[{}]", i),
                format!("endpoint '{}' must start with '/'", endpoint),
            ));
        }
    }

    errors
}

fn validate_precache(manifest: &PrecacheManifest) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if manifest.version.trim().is_empty() {
        errors.push(ValidationError::new(
            "precache.version",
            "cache version cannot be empty",
        ));
    }
    for (i, asset) in manifest.assets.iter().enumerate() {
        if !asset.path.starts_with('/') {
            errors.push(ValidationError::new(
                format!("precache.assets[{}].path", i),
                format!("asset path '{}' must start with '/'", asset.path),
            ));
        }
    }
    for (i, route) in manifest.routes.iter().enumerate() {
        if !route.starts_with('/') {
            errors.push(ValidationError::new(
                format!("precache.routes[{}]", i),
                format!("route '{}' must start with '/'", route),
            ));
        }
    }

    errors
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `server.base_url` or `precache.routes[0]`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chapel")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.base_url, "http://127.0.0.1:5000");
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.cache.max_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.cache.max_age_secs, 7 * 24 * 60 * 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.path, chapel_store::default_db_path());
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            [server]
            base_url = "https://app.example.org"

            [sync]
            wifi_only = true
            battery_threshold = 30

            [interceptor]
            excluded_endpoints = ["/api/auth/login"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.request_timeout_secs, 10);
        assert!(config.sync.wifi_only);
        assert_eq!(config.sync.battery_threshold, 30);
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.interceptor.excluded_endpoints.len(), 1);
        assert_eq!(config.interceptor.api_prefix, "/api/");
        assert_eq!(config.precache.version, chapel_core::DEFAULT_CACHE_VERSION);
    }

    #[test]
    fn test_interceptor_origin_defaults_to_base_url() {
        let mut config = Config::default();
        config.server.base_url = "https://app.example.org/".to_string();
        assert_eq!(
            config.interceptor_config().origin.as_deref(),
            Some("https://app.example.org")
        );

        config.interceptor.origin = Some("https://other.example.org".to_string());
        assert_eq!(
            config.interceptor_config().origin.as_deref(),
            Some("https://other.example.org")
        );
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.server.base_url = "localhost:5000".to_string();
        config.server.probe_interval_secs = 1;
        config.sync.max_retries = 0;
        config.sync.battery_threshold = 150;
        config.precache.routes.push("calendar".to_string());

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"server.base_url"));
        assert!(fields.contains(&"server.probe_interval_secs"));
        assert!(fields.contains(&"sync.max_retries"));
        assert!(fields.contains(&"sync.battery_threshold"));
        assert!(fields.contains(&"precache.routes[4]"));
    }

    #[test]
    fn test_cache_max_age_bounded() {
        let mut config = Config::default();
        config.cache.max_age_secs = u64::MAX;
        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "cache.max_age_secs");

        config.cache.max_age_secs = MAX_CACHE_AGE_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ConfigError::Validation(vec![ValidationError::new(
            "server.base_url",
            "bad",
        )]);
        assert!(err.to_string().contains("  - server.base_url: bad"));
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.server.base_url = "https://app.example.org".to_string();
        config.storage.path = PathBuf::from("/tmp/offline.db");
        config.sync.interval_secs = 120;
        config.background.enabled = false;

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/chapel.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
