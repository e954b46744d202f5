//! Network interceptor.
//!
//! Every data call goes through [`NetworkInterceptor::request`], which picks
//! between the network, the cache and the operation queue so call sites
//! never branch on connectivity themselves.
//!
//! | Connectivity | Method | Behavior |
//! |--------------|--------|----------|
//! | online | read | fetch, cache on success, cache fallback on failure |
//! | online | mutation | send; queue only if the network path fails |
//! | offline | read | cache or [`Error::DataUnavailable`] |
//! | offline | mutation | queue and return an optimistic success |
//!
//! Requests outside the API prefix, cross-origin requests, non-HTTP schemes
//! and excluded endpoints bypass all of this and go straight to the
//! transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use chapel_types::{DEFAULT_MAX_RETRIES, HttpMethod, NewOperation, OperationType, Priority};

use crate::cache::{CacheStore, cache_key, strip_origin};
use crate::connectivity::Connectivity;
use crate::error::{Error, Result};
use crate::queue::OperationQueue;
use crate::transport::{HttpRequest, Transport};

/// Interceptor behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Route data calls through the offline layer at all.
    pub enabled: bool,
    /// Mirror successful reads into the cache.
    pub cache_enabled: bool,
    /// Queue mutations that cannot reach the server.
    pub queue_enabled: bool,
    /// Path prefix identifying data endpoints.
    pub api_prefix: String,
    /// Origin of the backend. Absolute URLs elsewhere are cross-origin.
    pub origin: Option<String>,
    /// Endpoints that always bypass the interceptor.
    pub excluded_endpoints: Vec<String>,
    /// Oldest cached payload served in place of the network.
    pub cache_max_age_secs: Option<u64>,
    /// Endpoint prefixes whose mutations replay first.
    pub high_priority_prefixes: Vec<String>,
    /// Endpoint prefixes whose mutations replay last.
    pub low_priority_prefixes: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_enabled: true,
            queue_enabled: true,
            api_prefix: "/api/".to_string(),
            origin: None,
            excluded_endpoints: vec![
                "/api/auth/login".to_string(),
                "/api/auth/logout".to_string(),
                "/api/auth/register".to_string(),
            ],
            cache_max_age_secs: Some(24 * 60 * 60),
            high_priority_prefixes: vec!["/api/users".to_string(), "/api/auth".to_string()],
            low_priority_prefixes: vec!["/api/analytics".to_string(), "/api/logs".to_string()],
        }
    }
}

impl InterceptorConfig {
    pub fn cache_max_age(&self) -> Option<Duration> {
        self.cache_max_age_secs.map(Duration::from_secs)
    }

    /// Replay priority for mutations on `path`.
    pub fn priority_for(&self, path: &str) -> Priority {
        if self.high_priority_prefixes.iter().any(|p| path.starts_with(p)) {
            Priority::High
        } else if self.low_priority_prefixes.iter().any(|p| path.starts_with(p)) {
            Priority::Low
        } else {
            Priority::Normal
        }
    }

    /// Collection name for `path`: the first segment after the API prefix.
    pub fn category_for(&self, path: &str) -> String {
        path.strip_prefix(self.api_prefix.as_str())
            .and_then(|rest| rest.split(['/', '?']).next())
            .filter(|s| !s.is_empty())
            .unwrap_or("general")
            .to_string()
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self::with_body(HttpMethod::Post, body)
    }

    pub fn put(body: Value) -> Self {
        Self::with_body(HttpMethod::Put, body)
    }

    pub fn patch(body: Value) -> Self {
        Self::with_body(HttpMethod::Patch, body)
    }

    pub fn delete() -> Self {
        Self {
            method: HttpMethod::Delete,
            ..Default::default()
        }
    }

    fn with_body(method: HttpMethod, body: Value) -> Self {
        Self {
            method,
            body: Some(body),
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Result of an intercepted call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptedResponse {
    pub data: Value,
    /// Served from the cache instead of the network.
    pub from_cache: bool,
    /// Connectivity at the time of the call.
    pub is_online: bool,
    /// Optimistic answer for a queued mutation.
    pub offline: bool,
    /// Id of the queued operation, when one was created.
    pub operation_id: Option<String>,
}

impl InterceptedResponse {
    fn network(data: Value) -> Self {
        Self {
            data,
            from_cache: false,
            is_online: true,
            offline: false,
            operation_id: None,
        }
    }

    fn cached(data: Value, is_online: bool) -> Self {
        Self {
            data,
            from_cache: true,
            is_online,
            offline: false,
            operation_id: None,
        }
    }

    fn queued(id: String, is_online: bool) -> Self {
        Self {
            data: json!({ "success": true, "offline": true, "operationId": id }),
            from_cache: false,
            is_online,
            offline: true,
            operation_id: Some(id),
        }
    }
}

/// Routes data calls through online/offline handling.
pub struct NetworkInterceptor {
    config: InterceptorConfig,
    enabled: AtomicBool,
    max_retries: AtomicU32,
    transport: Arc<dyn Transport>,
    cache: CacheStore,
    queue: Arc<OperationQueue>,
    connectivity: Connectivity,
}

impl NetworkInterceptor {
    pub fn new(
        config: InterceptorConfig,
        transport: Arc<dyn Transport>,
        cache: CacheStore,
        queue: Arc<OperationQueue>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            max_retries: AtomicU32::new(DEFAULT_MAX_RETRIES),
            config,
            transport,
            cache,
            queue,
            connectivity,
        }
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::Relaxed) {
            info!("Network interceptor enabled");
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::Relaxed) {
            info!("Network interceptor disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Retry ceiling for operations this interceptor queues.
    pub fn set_max_retries(&self, max_retries: u32) {
        self.max_retries.store(max_retries.max(1), Ordering::Relaxed);
    }

    /// Whether `endpoint` is a same-origin data endpoint handled offline.
    pub fn intercepts(&self, endpoint: &str) -> bool {
        if let Some((scheme, _)) = endpoint.split_once("://") {
            if scheme != "http" && scheme != "https" {
                return false;
            }
            let matches_origin = self
                .config
                .origin
                .as_deref()
                .is_some_and(|origin| same_origin(endpoint, origin));
            if !matches_origin {
                return false;
            }
        } else if endpoint.contains(':') && !endpoint.starts_with('/') {
            // data:, blob:, chrome-extension: and friends
            return false;
        }

        let path = strip_origin(endpoint);
        let bare = path.split(['?', '#']).next().unwrap_or(path);
        path.starts_with(self.config.api_prefix.as_str())
            && !self.config.excluded_endpoints.iter().any(|e| e == bare)
    }

    /// Perform a data call with offline handling.
    pub async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<InterceptedResponse> {
        if !self.is_enabled() || !self.intercepts(endpoint) {
            return self.passthrough(endpoint, options).await;
        }

        let online = self.connectivity.is_online();
        match (online, options.method.is_read()) {
            (true, true) => self.online_read(endpoint, options).await,
            (true, false) => self.online_mutation(endpoint, options).await,
            (false, true) => self.offline_read(endpoint).await,
            (false, false) => {
                let id = self.enqueue(endpoint, &options).await?;
                debug!("Offline {} {} queued as {}", options.method, endpoint, id);
                Ok(InterceptedResponse::queued(id, false))
            }
        }
    }

    async fn passthrough(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<InterceptedResponse> {
        debug!("Bypassing interceptor for {}", endpoint);
        let request = HttpRequest::new(options.method, endpoint)
            .headers(&options.headers)
            .body(options.body);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(Error::http(endpoint, response.status));
        }
        Ok(InterceptedResponse {
            is_online: self.connectivity.is_online(),
            ..InterceptedResponse::network(response.json_body().unwrap_or(Value::Null))
        })
    }

    async fn online_read(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<InterceptedResponse> {
        let failure = match self.network_read(endpoint, options).await {
            Ok(data) => return Ok(InterceptedResponse::network(data)),
            Err(e) => e,
        };

        warn!("Fetch of {} failed, trying cache: {}", endpoint, failure);
        match self.cached(&cache_key(endpoint)).await {
            Some(data) => Ok(InterceptedResponse::cached(data, true)),
            None => Err(Error::data_unavailable(endpoint)),
        }
    }

    /// GET `endpoint` from the network and cache the body, without falling
    /// back to the cache. Errors are the transport's own, so callers can
    /// decide whether a retry is worth it.
    pub async fn refresh(&self, endpoint: &str) -> Result<Value> {
        self.network_read(endpoint, RequestOptions::get()).await
    }

    async fn network_read(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        let request = HttpRequest::new(options.method, endpoint).headers(&options.headers);
        let resp = self.transport.send(request).await?;
        if !resp.is_success() {
            return Err(Error::http(endpoint, resp.status));
        }
        let data = resp.json_body()?;
        if self.config.cache_enabled && options.method == HttpMethod::Get {
            let key = cache_key(endpoint);
            let etag = resp.etag().map(str::to_string);
            self.cache.put(&key, data.clone(), etag).await;
            let category = self.config.category_for(&key);
            self.cache.record_sync_time(&category).await;
        }
        Ok(data)
    }

    async fn online_mutation(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<InterceptedResponse> {
        let request = HttpRequest::new(options.method, endpoint)
            .header("Content-Type", "application/json")
            .headers(&options.headers)
            .body(options.body.clone());

        match self.transport.send(request).await {
            Ok(resp) if resp.is_success() => {
                let data = resp.json_body().unwrap_or(Value::Null);
                if self.config.cache_enabled && !data.is_null() {
                    self.cache.put(&cache_key(endpoint), data.clone(), None).await;
                }
                Ok(InterceptedResponse::network(data))
            }
            Ok(resp) => Err(Error::http(endpoint, resp.status)),
            Err(e) if e.is_network_failure() && self.config.queue_enabled => {
                warn!("Mutation {} {} failed, queueing: {}", options.method, endpoint, e);
                let id = self.enqueue(endpoint, &options).await?;
                Ok(InterceptedResponse::queued(id, false))
            }
            Err(e) => Err(e),
        }
    }

    async fn offline_read(&self, endpoint: &str) -> Result<InterceptedResponse> {
        match self.cached(&cache_key(endpoint)).await {
            Some(data) => Ok(InterceptedResponse::cached(data, false)),
            None => Err(Error::data_unavailable(endpoint)),
        }
    }

    async fn cached(&self, key: &str) -> Option<Value> {
        if !self.config.cache_enabled {
            return None;
        }
        self.cache.get(key, self.config.cache_max_age()).await
    }

    async fn enqueue(&self, endpoint: &str, options: &RequestOptions) -> Result<String> {
        if !self.config.queue_enabled {
            return Err(Error::Offline {
                endpoint: endpoint.to_string(),
            });
        }

        let path = strip_origin(endpoint);
        let op_type = OperationType::from_method(options.method).unwrap_or(OperationType::Update);
        let mut op = NewOperation::new(op_type, options.method, path)
            .priority(self.config.priority_for(path))
            .max_retries(self.max_retries.load(Ordering::Relaxed))
            .category(self.config.category_for(path))
            .description(format!("{} {}", op_type, path));
        op.headers = options.headers.clone();
        if let Some(body) = &options.body {
            op = op.payload(body.clone());
        }

        self.queue.enqueue(op).await
    }
}

/// Whether absolute `endpoint` lives under `origin`. The origin must end
/// at a path, query or fragment boundary, so a longer host or an explicit
/// port does not match.
fn same_origin(endpoint: &str, origin: &str) -> bool {
    let origin = origin.trim_end_matches('/');
    endpoint
        .get(..origin.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(origin))
        && matches!(
            endpoint[origin.len()..].chars().next(),
            None | Some('/' | '?' | '#')
        )
}
