//! HTTP transport abstraction.
//!
//! Everything in the offline core talks to the backend through the
//! [`Transport`] trait so tests can substitute [`MockTransport`](crate::MockTransport)
//! for a real client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use chapel_types::HttpMethod;

use crate::error::Result;

/// An outbound request. `url` is either a path relative to the backend
/// origin or an absolute URL.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }
}

/// A response received from the backend. Header names are lowercase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// A JSON response with the matching content type.
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            headers: BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: value.to_string().into_bytes(),
        }
    }

    /// A raw response with an explicit content type.
    pub fn bytes(status: u16, body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Self {
            status,
            headers: BTreeMap::from([("content-type".to_string(), content_type.to_string())]),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Decode the body as JSON. An empty body decodes to `null`.
    pub fn json_body(&self) -> Result<Value> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Sends requests to the backend.
///
/// Implementations return `Ok` for every HTTP answer, including error
/// statuses; `Err` means no answer arrived (connection failure, timeout).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[cfg(feature = "http")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "http")]
mod reqwest_transport {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{Client, Method};

    use chapel_types::HttpMethod;

    use super::{HttpRequest, HttpResponse, Transport};
    use crate::error::{Error, Result};

    /// [`Transport`] backed by a shared reqwest client.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: Client,
        base_url: String,
        timeout: Duration,
    }

    impl ReqwestTransport {
        /// Create a transport for `base_url` (e.g. "https://app.example.org").
        pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
            let base_url = base_url.trim_end_matches('/').to_string();

            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err(Error::invalid_config(format!(
                    "URL must start with http:// or https://, got: {}",
                    base_url
                )));
            }

            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::invalid_config(format!("HTTP client: {}", e)))?;

            Ok(Self {
                client,
                base_url,
                timeout,
            })
        }

        pub fn base_url(&self) -> &str {
            &self.base_url
        }

        fn resolve(&self, url: &str) -> String {
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else if url.starts_with('/') {
                format!("{}{}", self.base_url, url)
            } else {
                format!("{}/{}", self.base_url, url)
            }
        }
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let url = self.resolve(&request.url);
            let mut builder = self.client.request(method(request.method), &url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("{} {}", request.method, request.url), self.timeout)
                } else {
                    Error::transport(&request.url, e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::transport(&request.url, e.to_string()))?
                .to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_transport_normalizes_url() {
            let t = ReqwestTransport::new("http://localhost:5000/", Duration::from_secs(10)).unwrap();
            assert_eq!(t.base_url(), "http://localhost:5000");
            assert_eq!(t.resolve("/api/users"), "http://localhost:5000/api/users");
            assert_eq!(t.resolve("api/users"), "http://localhost:5000/api/users");
            assert_eq!(t.resolve("https://cdn.example.org/x"), "https://cdn.example.org/x");
        }

        #[test]
        fn test_transport_invalid_url() {
            let result = ReqwestTransport::new("localhost:5000", Duration::from_secs(10));
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        }
    }
}
