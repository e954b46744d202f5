//! Mock transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without a network so the
//! interceptor, queue and sync engine can be exercised deterministically.
//!
//! # Features
//!
//! - **Scripted responses**: per method and URL, with one-shot overrides
//! - **Failure injection**: go offline, or fail the next N requests
//! - **Latency simulation**: delay every request
//! - **Request log**: inspect exactly what was sent

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use chapel_types::HttpMethod;

use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpResponse, Transport};

type RouteKey = (HttpMethod, String);

/// A scripted in-memory backend.
///
/// # Example
///
/// ```
/// use chapel_core::{HttpRequest, HttpResponse, MockTransport, Transport};
/// use chapel_types::HttpMethod;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() {
///     let mock = MockTransport::new();
///     mock.respond(HttpMethod::Get, "/api/users", HttpResponse::json(200, &json!([])))
///         .await;
///
///     let resp = mock.send(HttpRequest::get("/api/users")).await.unwrap();
///     assert!(resp.is_success());
///     assert_eq!(mock.request_count(), 1);
/// }
/// ```
pub struct MockTransport {
    routes: RwLock<HashMap<RouteKey, HttpResponse>>,
    once: RwLock<HashMap<RouteKey, VecDeque<HttpResponse>>>,
    fallback: RwLock<HttpResponse>,
    log: RwLock<Vec<HttpRequest>>,
    request_count: AtomicU32,
    offline: AtomicBool,
    /// Number of requests to fail before answering again.
    remaining_failures: AtomicU32,
    /// Simulated latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("offline", &self.offline.load(Ordering::Relaxed))
            .field("request_count", &self.request_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock that answers 404 to everything until scripted.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            once: RwLock::new(HashMap::new()),
            fallback: RwLock::new(HttpResponse::new(404)),
            log: RwLock::new(Vec::new()),
            request_count: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Answer every `method url` request with `response`.
    pub async fn respond(&self, method: HttpMethod, url: &str, response: HttpResponse) {
        self.routes
            .write()
            .await
            .insert((method, url.to_string()), response);
    }

    /// Answer the next `method url` request with `response`, ahead of any
    /// persistent route.
    pub async fn respond_once(&self, method: HttpMethod, url: &str, response: HttpResponse) {
        self.once
            .write()
            .await
            .entry((method, url.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Response for requests with no route.
    pub async fn set_fallback(&self, response: HttpResponse) {
        *self.fallback.write().await = response;
    }

    /// Simulate losing (or regaining) the network entirely.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Fail the next `count` requests with a transport error.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    pub fn remaining_failures(&self) -> u32 {
        self.remaining_failures.load(Ordering::Relaxed)
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Total requests received, including failed ones.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Every request received, in arrival order.
    pub async fn requests(&self) -> Vec<HttpRequest> {
        self.log.read().await.clone()
    }

    /// Requests received for `url`.
    pub async fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.log
            .read()
            .await
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    pub async fn reset_requests(&self) {
        self.log.write().await.clear();
        self.request_count.store(0, Ordering::Relaxed);
    }

    fn check_should_fail(&self, url: &str) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(Error::transport(url, "network unreachable"));
        }

        let took = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(Error::transport(url, "connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.log.write().await.push(request.clone());
        self.check_should_fail(&request.url)?;

        let key = (request.method, request.url);
        if let Some(queue) = self.once.write().await.get_mut(&key)
            && let Some(response) = queue.pop_front()
        {
            return Ok(response);
        }

        if let Some(response) = self.routes.read().await.get(&key) {
            return Ok(response.clone());
        }

        Ok(self.fallback.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_scripted_routes() {
        let mock = MockTransport::new();
        mock.respond(HttpMethod::Get, "/api/users", HttpResponse::json(200, &json!([1])))
            .await;
        mock.respond_once(HttpMethod::Get, "/api/users", HttpResponse::new(503))
            .await;

        let first = mock.send(HttpRequest::get("/api/users")).await.unwrap();
        assert_eq!(first.status, 503);
        let second = mock.send(HttpRequest::get("/api/users")).await.unwrap();
        assert_eq!(second.json_body().unwrap(), json!([1]));

        let missing = mock.send(HttpRequest::get("/api/none")).await.unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(mock.request_count(), 3);
        assert_eq!(mock.requests_to("/api/users").await.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_transient_failures() {
        let mock = MockTransport::new();
        mock.set_fallback(HttpResponse::new(200)).await;
        mock.set_transient_failures(2);

        assert!(mock.send(HttpRequest::get("/a")).await.is_err());
        assert!(mock.send(HttpRequest::get("/a")).await.is_err());
        assert!(mock.send(HttpRequest::get("/a")).await.is_ok());
        assert_eq!(mock.remaining_failures(), 0);
    }

    #[tokio::test]
    async fn test_mock_offline() {
        let mock = MockTransport::new();
        mock.set_offline(true);
        let err = mock.send(HttpRequest::get("/a")).await.unwrap_err();
        assert!(err.is_network_failure());

        mock.set_offline(false);
        assert!(mock.send(HttpRequest::get("/a")).await.is_ok());
    }
}
