//! Composition root for the Chapel offline subsystem.
//!
//! This crate provides:
//! - [`OfflineService`], the single object the UI layer talks to
//! - TOML configuration with validation
//! - The `chapel` binary, which runs the sync daemon and exposes
//!   diagnostics for the queue, cache and sync state
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/chapel/config.toml`:
//!
//! ```toml
//! [server]
//! base_url = "https://app.example.org"
//! health_path = "/api/health"
//!
//! [storage]
//! path = "~/.local/share/chapel/offline.db"
//!
//! [sync]
//! interval_secs = 30
//! wifi_only = false
//! battery_threshold = 20
//! max_retries = 3
//! ```
//!
//! # Offline policy
//!
//! Interception and shell precaching can be tuned as well:
//!
//! ```toml
//! [interceptor]
//! api_prefix = "/api/"
//! excluded_endpoints = ["/api/auth/login", "/api/auth/logout", "/api/auth/register"]
//! cache_max_age_secs = 86400
//!
//! [cache]
//! max_size_bytes = 10485760
//! max_age_secs = 604800
//!
//! [precache]
//! version = "chapel-shell-v1"
//! routes = ["/dashboard", "/users", "/calendar", "/settings"]
//! ```

pub mod config;
pub mod service;

pub use config::{
    BackgroundConfig, CacheConfig, Config, ConfigError, ServerConfig, StorageConfig,
    ValidationError, default_config_path,
};
pub use service::{
    COLLECTIONS, DataFreshness, DownloadReport, FRESHNESS_WINDOW, OfflineService,
    OfflineServiceBuilder,
};
