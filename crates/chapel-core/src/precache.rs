//! Install-time asset cache.
//!
//! Fetches the shell manifest into a versioned asset cache so the
//! application can render without network right after install. Individual
//! fetch failures are logged and skipped; only required assets are retried.
//! Activating a version deletes every other version.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use chapel_store::StoredAsset;

use crate::SharedStore;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, with_retry};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Default cache version identifier.
pub const DEFAULT_CACHE_VERSION: &str = "chapel-shell-v1";

/// One entry of the shell manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellAsset {
    pub path: String,
    /// The shell cannot render without it.
    #[serde(default)]
    pub required: bool,
}

impl ShellAsset {
    pub fn required(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            required: true,
        }
    }

    pub fn optional(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }
}

/// What to fetch at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecacheManifest {
    pub version: String,
    pub assets: Vec<ShellAsset>,
    /// Route shells (client-side routes served by the entry document).
    pub routes: Vec<String>,
}

impl Default for PrecacheManifest {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            assets: vec![
                ShellAsset::required("/"),
                ShellAsset::optional("/static/js/bundle.js"),
                ShellAsset::optional("/static/css/main.css"),
                ShellAsset::optional("/manifest.json"),
                ShellAsset::optional("/pwa-192x192.png"),
                ShellAsset::optional("/pwa-512x512.png"),
                ShellAsset::optional("/favicon.ico"),
            ],
            routes: ["/dashboard", "/users", "/calendar", "/settings"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl PrecacheManifest {
    /// Every entry to fetch, assets first.
    pub fn entries(&self) -> Vec<ShellAsset> {
        self.assets
            .iter()
            .cloned()
            .chain(self.routes.iter().map(ShellAsset::optional))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.assets.len() + self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFailure {
    pub path: String,
    pub required: bool,
    pub error: String,
}

/// Outcome of an install pass. Partial success is still success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub version: String,
    pub cached: usize,
    pub failed: Vec<AssetFailure>,
}

impl InstallReport {
    /// Whether any required asset is missing.
    pub fn missing_required(&self) -> bool {
        self.failed.iter().any(|f| f.required)
    }
}

/// Fetches and serves the versioned shell cache.
pub struct AssetPrecacher {
    store: SharedStore,
    transport: Arc<dyn Transport>,
    manifest: PrecacheManifest,
    retry: RetryConfig,
}

impl AssetPrecacher {
    pub fn new(store: SharedStore, transport: Arc<dyn Transport>, manifest: PrecacheManifest) -> Self {
        Self {
            store,
            transport,
            manifest,
            retry: RetryConfig::for_required_asset(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn manifest(&self) -> &PrecacheManifest {
        &self.manifest
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    async fn fetch(&self, path: &str) -> Result<HttpResponse> {
        let response = self.transport.send(HttpRequest::get(path)).await?;
        if !response.is_success() {
            return Err(Error::http(path, response.status));
        }
        Ok(response)
    }

    async fn fetch_asset(&self, asset: &ShellAsset) -> Result<HttpResponse> {
        if asset.required {
            with_retry(&self.retry, &format!("precache {}", asset.path), || {
                self.fetch(&asset.path)
            })
            .await
        } else {
            self.fetch(&asset.path).await
        }
    }

    /// Fetch every manifest entry into the current version.
    ///
    /// Only storage failures abort the install.
    pub async fn install(&self) -> Result<InstallReport> {
        let entries = self.manifest.entries();
        info!(
            "Precaching {} shell assets into {}",
            entries.len(),
            self.manifest.version
        );

        let results = join_all(entries.iter().map(|asset| self.fetch_asset(asset))).await;

        let mut report = InstallReport {
            version: self.manifest.version.clone(),
            ..Default::default()
        };
        let store = self.store.lock().await;
        for (asset, result) in entries.into_iter().zip(results) {
            match result {
                Ok(response) => {
                    store.put_asset(
                        &self.manifest.version,
                        &asset.path,
                        &response.body,
                        response.content_type(),
                    )?;
                    report.cached += 1;
                    debug!("Precached {}", asset.path);
                }
                Err(e) => {
                    if asset.required {
                        error!("Failed to precache required asset {}: {}", asset.path, e);
                    } else {
                        warn!("Skipping asset {}: {}", asset.path, e);
                    }
                    report.failed.push(AssetFailure {
                        path: asset.path,
                        required: asset.required,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Precache finished: {} cached, {} failed",
            report.cached,
            report.failed.len()
        );
        Ok(report)
    }

    /// Delete every cache version except the current one.
    pub async fn activate(&self) -> Result<usize> {
        let removed = self
            .store
            .lock()
            .await
            .delete_asset_versions_except(&self.manifest.version)?;
        if removed > 0 {
            info!("Removed {} stale shell asset(s)", removed);
        }
        Ok(removed)
    }

    /// Serve a cached shell asset.
    pub async fn match_asset(&self, path: &str) -> Option<StoredAsset> {
        let store = self.store.lock().await;
        store
            .get_asset(&self.manifest.version, path)
            .unwrap_or_else(|e| {
                warn!("Asset cache read for {} failed: {}", path, e);
                None
            })
    }

    pub async fn cached_count(&self) -> u64 {
        let store = self.store.lock().await;
        store.count_assets(&self.manifest.version).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use chapel_store::Store;
    use chapel_types::HttpMethod;
    use std::time::Duration;

    fn setup(manifest: PrecacheManifest) -> (AssetPrecacher, Arc<MockTransport>, SharedStore) {
        let store: SharedStore = Arc::new(tokio::sync::Mutex::new(Store::open_in_memory().unwrap()));
        let mock = Arc::new(MockTransport::new());
        let precacher = AssetPrecacher::new(store.clone(), mock.clone(), manifest).with_retry(
            RetryConfig::new(2)
                .initial_delay(Duration::from_millis(1))
                .jitter(false),
        );
        (precacher, mock, store)
    }

    #[test]
    fn test_default_manifest() {
        let manifest = PrecacheManifest::default();
        assert_eq!(manifest.len(), 11);
        assert!(manifest.assets.iter().any(|a| a.path == "/" && a.required));
        assert_eq!(manifest.entries().len(), manifest.len());
    }

    #[tokio::test]
    async fn test_install_skips_unreachable_route() {
        let (precacher, mock, _) = setup(PrecacheManifest::default());
        mock.set_fallback(HttpResponse::bytes(200, "<html></html>", "text/html"))
            .await;
        mock.respond(HttpMethod::Get, "/calendar", HttpResponse::new(404))
            .await;

        let report = precacher.install().await.unwrap();
        assert_eq!(report.cached, 10);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.missing_required());
        assert_eq!(precacher.cached_count().await, 10);

        let asset = precacher.match_asset("/").await.unwrap();
        assert_eq!(asset.content_type.as_deref(), Some("text/html"));
        assert!(precacher.match_asset("/calendar").await.is_none());
    }

    #[tokio::test]
    async fn test_required_asset_is_retried() {
        let manifest = PrecacheManifest {
            assets: vec![ShellAsset::required("/")],
            routes: Vec::new(),
            ..Default::default()
        };
        let (precacher, mock, _) = setup(manifest);
        mock.set_fallback(HttpResponse::bytes(200, "<html>", "text/html"))
            .await;
        mock.respond_once(HttpMethod::Get, "/", HttpResponse::new(503))
            .await;

        let report = precacher.install().await.unwrap();
        assert_eq!(report.cached, 1);
        assert_eq!(mock.requests_to("/").await.len(), 2);
    }

    #[tokio::test]
    async fn test_required_failure_reported() {
        let manifest = PrecacheManifest {
            assets: vec![ShellAsset::required("/"), ShellAsset::optional("/favicon.ico")],
            routes: Vec::new(),
            ..Default::default()
        };
        let (precacher, mock, _) = setup(manifest);
        mock.respond(HttpMethod::Get, "/", HttpResponse::new(500)).await;
        mock.respond(
            HttpMethod::Get,
            "/favicon.ico",
            HttpResponse::bytes(200, vec![0u8; 4], "image/x-icon"),
        )
        .await;

        let report = precacher.install().await.unwrap();
        assert!(report.missing_required());
        assert_eq!(report.cached, 1);
        assert_eq!(mock.requests_to("/").await.len(), 3);
    }

    #[tokio::test]
    async fn test_activate_keeps_single_version() {
        let (precacher, mock, store) = setup(PrecacheManifest {
            routes: Vec::new(),
            ..Default::default()
        });
        mock.set_fallback(HttpResponse::bytes(200, "x", "text/plain")).await;
        store
            .lock()
            .await
            .put_asset("chapel-shell-v0", "/", b"old", None)
            .unwrap();

        precacher.install().await.unwrap();
        assert_eq!(precacher.activate().await.unwrap(), 1);
        assert_eq!(
            store.lock().await.asset_versions().unwrap(),
            vec![DEFAULT_CACHE_VERSION.to_string()]
        );
    }
}
