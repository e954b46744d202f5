//! The offline service object handed to the UI layer.
//!
//! [`OfflineService`] owns one instance of every offline component and
//! wires them together. It is constructed once at startup with
//! [`OfflineService::builder`], brought up with
//! [`initialize`](OfflineService::initialize) and torn down with
//! [`shutdown`](OfflineService::shutdown).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chapel_core::{
    AssetPrecacher, BackgroundPlatform, BackgroundRunner, BackgroundSyncService, CacheStore,
    Connectivity, ConnectivityProbe, DrainReport, EventReceiver, InProcessPlatform,
    InstallReport, InterceptedResponse, NetworkInterceptor, NoopPlatform, OperationQueue,
    ReqwestTransport, RequestOptions, Result, RetryConfig, SharedStore, SyncEngine, SyncOutcome,
    Transport, with_retry,
};
use chapel_store::{QueueQuery, Store};
use chapel_types::{
    DEFAULT_MAX_RETRIES, NewOperation, OfflineStatus, QueuedOperation, SyncConfig, SyncTag,
};

use crate::config::Config;

/// Metadata key holding the unix time of the last full download.
pub const FULL_DOWNLOAD_KEY: &str = "full_download_timestamp";

/// Age after which downloaded data counts as stale.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Collection endpoints fetched by [`OfflineService::download_all`].
pub const COLLECTIONS: [&str; 7] = [
    "/api/users",
    "/api/tasks",
    "/api/interested",
    "/api/events",
    "/api/prayers",
    "/api/activities",
    "/api/churches",
];

/// How recent the locally downloaded data is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFreshness {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_download: Option<OffsetDateTime>,
    /// No download yet, or the last one is older than [`FRESHNESS_WINDOW`].
    pub stale: bool,
}

/// Outcome of [`OfflineService::download_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadReport {
    /// Endpoints fetched from the network and cached.
    pub fetched: Vec<String>,
    /// Endpoints that could not be fetched, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Builder for [`OfflineService`].
pub struct OfflineServiceBuilder {
    config: Config,
    store: Option<Store>,
    transport: Option<Arc<dyn Transport>>,
    platform: Option<Arc<dyn BackgroundPlatform>>,
    connectivity: Option<Connectivity>,
    download_retry: RetryConfig,
}

impl OfflineServiceBuilder {
    /// Use an already opened store instead of `storage.path`.
    #[must_use]
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom transport instead of HTTP to `server.base_url`.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom background platform instead of the in-process one.
    #[must_use]
    pub fn platform(mut self, platform: Arc<dyn BackgroundPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Share an existing connectivity signal.
    #[must_use]
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Retry policy for each collection in [`OfflineService::download_all`].
    #[must_use]
    pub fn download_retry(mut self, retry: RetryConfig) -> Self {
        self.download_retry = retry;
        self
    }

    pub fn build(self) -> Result<OfflineService> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => Store::open(&config.storage.path)?,
        };
        let store: SharedStore = Arc::new(Mutex::new(store));

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                &config.server.base_url,
                config.server.request_timeout(),
            )?),
        };

        let mut background_rx = None;
        let platform: Arc<dyn BackgroundPlatform> = match self.platform {
            Some(platform) => platform,
            None if config.background.enabled => {
                let (platform, rx) = InProcessPlatform::new(config.background.delay());
                background_rx = Some(rx);
                Arc::new(platform)
            }
            None => Arc::new(NoopPlatform),
        };

        let connectivity = self.connectivity.unwrap_or_default();
        let cache = CacheStore::new(store.clone());
        let queue = Arc::new(OperationQueue::new(store.clone(), transport.clone()));
        let interceptor = NetworkInterceptor::new(
            config.interceptor_config(),
            transport.clone(),
            cache.clone(),
            queue.clone(),
            connectivity.clone(),
        );
        let engine = SyncEngine::new(
            queue.clone(),
            cache.clone(),
            store.clone(),
            connectivity.clone(),
            config.sync.clone(),
        )
        .with_maintenance(config.cache.policy());
        let precacher =
            AssetPrecacher::new(store.clone(), transport.clone(), config.precache.clone());

        Ok(OfflineService {
            config,
            store,
            transport,
            connectivity,
            cache,
            queue,
            interceptor,
            engine,
            background: Arc::new(BackgroundSyncService::new(platform)),
            background_rx: Mutex::new(background_rx),
            precacher,
            download_retry: self.download_retry,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        })
    }
}

/// Offline subsystem facade.
pub struct OfflineService {
    config: Config,
    store: SharedStore,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    cache: CacheStore,
    queue: Arc<OperationQueue>,
    interceptor: NetworkInterceptor,
    engine: SyncEngine,
    background: Arc<BackgroundSyncService>,
    background_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTag>>>,
    precacher: AssetPrecacher,
    download_retry: RetryConfig,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl OfflineService {
    pub fn builder(config: Config) -> OfflineServiceBuilder {
        OfflineServiceBuilder {
            config,
            store: None,
            transport: None,
            platform: None,
            connectivity: None,
            download_retry: RetryConfig::for_download(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Restore persisted sync state. Safe to call more than once.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.restore().await?;
        let sync_config = self.engine.config().await;
        self.interceptor.set_max_retries(sync_config.max_retries);

        let pending = self.queue.len().await?;
        info!(
            "Offline service initialized ({} pending operation(s), sync every {:?})",
            pending,
            sync_config.interval()
        );
        Ok(())
    }

    /// Stop scheduling and every worker task.
    pub async fn shutdown(&self) {
        self.engine.stop().await;
        self.cancel_token.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Offline service shut down");
    }

    /// Start delivering in-process background triggers.
    ///
    /// Returns `false` when a custom platform or no platform is in use.
    pub async fn spawn_background_runner(&self) -> bool {
        let Some(rx) = self.background_rx.lock().await.take() else {
            return false;
        };
        let handle = BackgroundRunner::spawn(
            rx,
            self.engine.clone(),
            self.background.clone(),
            self.cancel_token.child_token(),
        );
        self.tasks.lock().await.push(handle);
        true
    }

    /// Start probing `server.health_path` to track connectivity.
    pub async fn spawn_connectivity_probe(&self) {
        let handle = self.probe().spawn(self.cancel_token.child_token());
        self.tasks.lock().await.push(handle);
    }

    fn probe(&self) -> ConnectivityProbe {
        ConnectivityProbe::new(
            self.transport.clone(),
            self.connectivity.clone(),
            self.config.server.health_path.clone(),
            self.config.server.probe_interval(),
        )
    }

    /// Probe the backend once and update the online flag.
    pub async fn probe_connectivity(&self) -> bool {
        self.probe().probe_once().await
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.engine.subscribe()
    }

    /// Snapshot of everything the UI renders.
    pub async fn status(&self) -> OfflineStatus {
        let queue = self.queue.stats().await.unwrap_or_else(|e| {
            warn!("Failed to read queue stats: {}", e);
            Default::default()
        });
        OfflineStatus {
            is_online: self.connectivity.is_online(),
            interceptor_enabled: self.interceptor.is_enabled(),
            cache: self.cache.stats().await,
            queue,
            sync_state: self.engine.state(),
            sync_stats: self.engine.stats().await,
            sync_config: self.engine.config().await,
            background_supported: self.background.is_supported(),
            registrations: self.background.registrations().await,
        }
    }

    /// Read an endpoint, falling back to the cache when the network fails.
    pub async fn fetch_with_offline_fallback(&self, endpoint: &str) -> Result<InterceptedResponse> {
        self.interceptor.request(endpoint, RequestOptions::get()).await
    }

    /// Any call through the interceptor.
    pub async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<InterceptedResponse> {
        self.interceptor.request(endpoint, options).await
    }

    /// Queue an operation directly. An operation still carrying the stock
    /// retry ceiling takes the configured `sync.max_retries` instead.
    pub async fn add_to_queue(&self, mut op: NewOperation) -> Result<String> {
        if op.max_retries == DEFAULT_MAX_RETRIES {
            op.max_retries = self.engine.config().await.max_retries.max(1);
        }
        self.queue.enqueue(op).await
    }

    /// Replay the queue once, outside the sync schedule. Dropped operations,
    /// conflicts and storage failures are folded into the sync stats.
    pub async fn process_queue(&self) -> Result<DrainReport> {
        let report = self.queue.drain().await?;
        self.engine.record_drain(&report).await;
        Ok(report)
    }

    pub async fn clear_queue(&self) -> Result<usize> {
        self.queue.clear().await
    }

    pub async fn pending_operations(&self, query: Option<&QueueQuery>) -> Result<Vec<QueuedOperation>> {
        match query {
            Some(query) => self.queue.pending_matching(query).await,
            None => self.queue.pending().await,
        }
    }

    pub async fn start_sync(&self) {
        self.engine.start().await;
    }

    pub async fn stop_sync(&self) {
        self.engine.stop().await;
    }

    pub async fn sync_now(&self) -> SyncOutcome {
        self.engine.sync_now().await
    }

    /// Replace the sync policy; new operations pick up the retry ceiling.
    pub async fn update_sync_config(&self, config: SyncConfig) -> Result<()> {
        self.interceptor.set_max_retries(config.max_retries);
        self.engine.update_config(config).await
    }

    pub async fn reset_sync_stats(&self) {
        self.engine.reset_stats().await;
    }

    /// Request a background sync for `tag`, or a general one.
    pub async fn register_background_sync(&self, tag: Option<SyncTag>) -> bool {
        match tag {
            Some(tag) => self.background.register_type_sync(tag).await,
            None => self.background.register_general_sync().await,
        }
    }

    pub async fn force_background_sync(&self) -> bool {
        self.background.force_sync().await
    }

    pub fn enable_interceptor(&self) {
        self.interceptor.enable();
    }

    pub fn disable_interceptor(&self) {
        self.interceptor.disable();
    }

    /// Install the shell assets and retire older cache versions.
    ///
    /// When a required asset could not be fetched the new version is not
    /// activated, so the previous shell stays servable.
    pub async fn precache_assets(&self) -> Result<InstallReport> {
        let report = self.precacher.install().await?;
        if report.missing_required() {
            warn!(
                "Shell {} is missing a required asset, keeping older versions",
                report.version
            );
            return Ok(report);
        }
        self.precacher.activate().await?;
        Ok(report)
    }

    pub fn precacher(&self) -> &AssetPrecacher {
        &self.precacher
    }

    pub async fn clear_cache(&self) -> Result<usize> {
        self.cache.clear().await
    }

    pub async fn data_freshness(&self) -> DataFreshness {
        let secs: Option<i64> = self
            .store
            .lock()
            .await
            .get_metadata(FULL_DOWNLOAD_KEY)
            .unwrap_or_else(|e| {
                warn!("Failed to read last download time: {}", e);
                None
            });
        let last_download = secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok());
        let stale = match last_download {
            Some(at) => OffsetDateTime::now_utc() - at > FRESHNESS_WINDOW,
            None => true,
        };
        DataFreshness {
            last_download,
            stale,
        }
    }

    /// Fetch every known collection from the network into the cache.
    ///
    /// Each collection is retried with the download policy. The download
    /// time is recorded only when every collection was fetched.
    pub async fn download_all(&self) -> Result<DownloadReport> {
        let mut report = DownloadReport::default();
        if !self.connectivity.is_online() {
            for endpoint in COLLECTIONS {
                report
                    .failed
                    .push((endpoint.to_string(), "offline".to_string()));
            }
            return Ok(report);
        }

        for endpoint in COLLECTIONS {
            let label = format!("download {}", endpoint);
            let fetched = with_retry(&self.download_retry, &label, || {
                self.interceptor.refresh(endpoint)
            })
            .await;
            match fetched {
                Ok(_) => {
                    debug!("Downloaded {}", endpoint);
                    report.fetched.push(endpoint.to_string());
                }
                Err(e) => {
                    warn!("Failed to download {}: {}", endpoint, e);
                    report.failed.push((endpoint.to_string(), e.to_string()));
                }
            }
        }

        if report.failed.is_empty() {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            self.store
                .lock()
                .await
                .set_metadata(FULL_DOWNLOAD_KEY, &now)?;
        }
        info!(
            "Downloaded {} of {} collections",
            report.fetched.len(),
            COLLECTIONS.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapel_core::{HttpResponse, MockTransport};
    use serde_json::json;

    fn service(mock: Arc<MockTransport>) -> OfflineService {
        OfflineService::builder(Config::default())
            .store(Store::open_in_memory().unwrap())
            .transport(mock)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_restores_persisted_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.db");

        {
            let svc = OfflineService::builder(Config::default())
                .store(Store::open(&path).unwrap())
                .transport(Arc::new(MockTransport::new()))
                .build()
                .unwrap();
            let config = SyncConfig {
                max_retries: 7,
                ..Default::default()
            };
            svc.update_sync_config(config).await.unwrap();
        }

        let svc = OfflineService::builder(Config::default())
            .store(Store::open(&path).unwrap())
            .transport(Arc::new(MockTransport::new()))
            .build()
            .unwrap();
        assert_eq!(
            svc.status().await.sync_config.max_retries,
            chapel_types::DEFAULT_MAX_RETRIES
        );
        svc.initialize().await.unwrap();
        assert_eq!(svc.status().await.sync_config.max_retries, 7);

        svc.connectivity().set_online(false);
        svc.request("/api/tasks/5", RequestOptions::delete())
            .await
            .unwrap();
        let ops = svc.pending_operations(None).await.unwrap();
        assert_eq!(ops[0].max_retries, 7);
    }

    #[tokio::test]
    async fn test_process_queue_records_dropped_operations() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(HttpResponse::new(500)).await;
        let svc = service(mock.clone());
        svc.initialize().await.unwrap();

        svc.connectivity().set_online(false);
        svc.request("/api/tasks/5", RequestOptions::put(json!({"status": "done"})))
            .await
            .unwrap();
        svc.connectivity().set_online(true);

        for _ in 0..chapel_types::DEFAULT_MAX_RETRIES {
            svc.process_queue().await.unwrap();
        }

        let status = svc.status().await;
        assert_eq!(status.pending_operations(), 0);
        assert_eq!(status.permanently_failed(), 1);
        assert_eq!(status.sync_stats.pending_operations, 0);
        assert!(status.sync_stats.last_error.is_some());
        assert_eq!(mock.requests_to("/api/tasks/5").await.len(), 3);
    }

    #[tokio::test]
    async fn test_add_to_queue_uses_configured_retries() {
        let svc = service(Arc::new(MockTransport::new()));
        svc.update_sync_config(SyncConfig {
            max_retries: 5,
            ..Default::default()
        })
        .await
        .unwrap();

        let op = NewOperation::new(
            chapel_types::OperationType::Create,
            chapel_types::HttpMethod::Post,
            "/api/tasks",
        );
        svc.add_to_queue(op).await.unwrap();
        let explicit = NewOperation::new(
            chapel_types::OperationType::Delete,
            chapel_types::HttpMethod::Delete,
            "/api/tasks/9",
        )
        .max_retries(1);
        svc.add_to_queue(explicit).await.unwrap();

        let ops = svc.pending_operations(None).await.unwrap();
        let created = ops.iter().find(|op| op.endpoint == "/api/tasks").unwrap();
        let deleted = ops.iter().find(|op| op.endpoint == "/api/tasks/9").unwrap();
        assert_eq!(created.max_retries, 5);
        assert_eq!(deleted.max_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_required_asset_keeps_previous_shell() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.db");

        let mut config = Config::default();
        config.precache.version = "chapel-shell-v1".to_string();
        {
            let mock = Arc::new(MockTransport::new());
            mock.set_fallback(HttpResponse::bytes(200, "<html>v1</html>", "text/html"))
                .await;
            let svc = OfflineService::builder(config.clone())
                .store(Store::open(&path).unwrap())
                .transport(mock)
                .build()
                .unwrap();
            let report = svc.precache_assets().await.unwrap();
            assert!(!report.missing_required());
        }

        config.precache.version = "chapel-shell-v2".to_string();
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(HttpResponse::bytes(200, "<html>v2</html>", "text/html"))
            .await;
        mock.respond(chapel_types::HttpMethod::Get, "/", HttpResponse::new(500))
            .await;
        let svc = OfflineService::builder(config)
            .store(Store::open(&path).unwrap())
            .transport(mock)
            .build()
            .unwrap();
        let report = svc.precache_assets().await.unwrap();
        assert!(report.missing_required());

        let versions = Store::open(&path).unwrap().asset_versions().unwrap();
        assert!(versions.iter().any(|v| v == "chapel-shell-v1"));
        assert!(svc.precacher().match_asset("/").await.is_none());
    }

    #[tokio::test]
    async fn test_status_reports_queue_and_cache() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            chapel_types::HttpMethod::Get,
            "/api/users",
            HttpResponse::json(200, &json!([{"id": 1}])),
        )
        .await;
        let svc = service(mock);
        svc.initialize().await.unwrap();

        svc.fetch_with_offline_fallback("/api/users").await.unwrap();
        svc.connectivity().set_online(false);
        svc.request("/api/tasks/5", RequestOptions::delete())
            .await
            .unwrap();

        let status = svc.status().await;
        assert!(!status.is_online);
        assert!(status.interceptor_enabled);
        assert_eq!(status.cache.total_items, 1);
        assert_eq!(status.pending_operations(), 1);
        assert!(status.background_supported);
    }

    #[tokio::test]
    async fn test_data_freshness_after_download() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(HttpResponse::json(200, &json!([]))).await;
        let svc = service(mock.clone());

        assert!(svc.data_freshness().await.stale);
        let report = svc.download_all().await.unwrap();
        assert_eq!(report.fetched.len(), COLLECTIONS.len());
        assert_eq!(mock.request_count(), COLLECTIONS.len() as u32);

        let freshness = svc.data_freshness().await;
        assert!(!freshness.stale);
        assert!(freshness.last_download.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_download_not_recorded() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(HttpResponse::json(200, &json!([]))).await;
        mock.respond(
            chapel_types::HttpMethod::Get,
            "/api/prayers",
            HttpResponse::new(500),
        )
        .await;
        let svc = service(mock);

        let report = svc.download_all().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "/api/prayers");
        assert!(svc.data_freshness().await.stale);
    }

    #[tokio::test]
    async fn test_download_retries_transient_failure() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(HttpResponse::json(200, &json!([]))).await;
        mock.respond_once(
            chapel_types::HttpMethod::Get,
            "/api/events",
            HttpResponse::new(503),
        )
        .await;
        let svc = OfflineService::builder(Config::default())
            .store(Store::open_in_memory().unwrap())
            .transport(mock.clone())
            .download_retry(
                RetryConfig::new(2)
                    .initial_delay(Duration::from_millis(1))
                    .jitter(false),
            )
            .build()
            .unwrap();

        let report = svc.download_all().await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.fetched.len(), COLLECTIONS.len());
        assert_eq!(mock.requests_to("/api/events").await.len(), 2);
        assert!(!svc.data_freshness().await.stale);
    }

    #[tokio::test]
    async fn test_download_offline_fetches_nothing() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(HttpResponse::json(200, &json!([]))).await;
        let svc = service(mock.clone());
        svc.connectivity().set_online(false);

        let report = svc.download_all().await.unwrap();
        assert!(report.fetched.is_empty());
        assert_eq!(report.failed.len(), COLLECTIONS.len());
        assert_eq!(mock.request_count(), 0);
        assert!(svc.data_freshness().await.stale);
    }

    #[tokio::test]
    async fn test_background_without_platform_degrades() {
        let mut config = Config::default();
        config.background.enabled = false;
        let svc = OfflineService::builder(config)
            .store(Store::open_in_memory().unwrap())
            .transport(Arc::new(MockTransport::new()))
            .build()
            .unwrap();

        assert!(!svc.register_background_sync(None).await);
        assert!(!svc.force_background_sync().await);
        assert!(!svc.spawn_background_runner().await);
        assert!(!svc.status().await.background_supported);
    }

    #[tokio::test]
    async fn test_interceptor_toggle() {
        let svc = service(Arc::new(MockTransport::new()));
        svc.disable_interceptor();
        assert!(!svc.status().await.interceptor_enabled);
        svc.enable_interceptor();
        assert!(svc.status().await.interceptor_enabled);
    }
}
