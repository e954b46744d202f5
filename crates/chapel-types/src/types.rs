//! Cache and operation-queue records.

use core::fmt;
use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Default retry ceiling for queued operations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A cached response payload.
///
/// At most one entry exists per key; writing the same key replaces the
/// previous payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical resource identifier (normalized endpoint path).
    pub key: String,
    /// Opaque JSON payload.
    pub payload: Value,
    /// When the entry was last written.
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
    /// Server-supplied validator, if any.
    pub etag: Option<String>,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
            stored_at: OffsetDateTime::now_utc(),
            etag: None,
        }
    }

    /// Attach an etag.
    #[must_use]
    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Whether the entry is older than `max_age` at `now`.
    pub fn is_expired(&self, max_age: time::Duration, now: OffsetDateTime) -> bool {
        now - self.stored_at > max_age
    }
}

/// Aggregate statistics over the cache collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cached entries.
    pub total_items: u64,
    /// Sum of serialized payload sizes in bytes.
    pub total_size: u64,
    /// Write time of the oldest entry.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub oldest_item: Option<OffsetDateTime>,
    /// Write time of the newest entry.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub newest_item: Option<OffsetDateTime>,
}

/// Kind of mutation a queued operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    /// Infer the operation type from an HTTP verb.
    ///
    /// Returns `None` for reads.
    ///
    /// ```
    /// use chapel_types::{HttpMethod, OperationType};
    ///
    /// assert_eq!(OperationType::from_method(HttpMethod::Post), Some(OperationType::Create));
    /// assert_eq!(OperationType::from_method(HttpMethod::Patch), Some(OperationType::Update));
    /// assert_eq!(OperationType::from_method(HttpMethod::Get), None);
    /// ```
    #[must_use]
    pub fn from_method(method: HttpMethod) -> Option<Self> {
        match method {
            HttpMethod::Post => Some(Self::Create),
            HttpMethod::Put | HttpMethod::Patch => Some(Self::Update),
            HttpMethod::Delete => Some(Self::Delete),
            HttpMethod::Get | HttpMethod::Head => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseError::unknown("operation type", s)),
        }
    }
}

/// HTTP verb used by the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Reads are served from cache when offline; everything else is queued.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }

    /// Whether a replayed request carries a JSON body.
    pub fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseError::unknown("HTTP method", s)),
        }
    }
}

/// Replay priority of a queued operation.
///
/// Ordered `Low < Normal < High`; the queue drains higher priorities first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
}

impl Priority {
    /// Numeric rank used for storage and ordering.
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = ParseError;

    fn try_from(value: u8) -> ParseResult<Self> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            other => Err(ParseError::OutOfRange {
                kind: "priority",
                value: i64::from(other),
            }),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(ParseError::unknown("priority", s)),
        }
    }
}

/// Free-form tags attached to a queued operation for filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub category: Option<String>,
    pub description: Option<String>,
}

/// A mutation to be queued, before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub op_type: OperationType,
    pub endpoint: String,
    pub method: HttpMethod,
    pub payload: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    pub max_retries: u32,
    pub metadata: OperationMetadata,
}

impl NewOperation {
    /// Create an operation with default priority and retry ceiling.
    pub fn new(op_type: OperationType, method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            op_type,
            endpoint: endpoint.into(),
            method,
            payload: None,
            headers: BTreeMap::new(),
            priority: Priority::Normal,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: OperationMetadata::default(),
        }
    }

    /// Create an operation for a mutating request, inferring its type.
    ///
    /// Returns `None` when `method` is a read.
    pub fn for_request(method: HttpMethod, endpoint: impl Into<String>) -> Option<Self> {
        OperationType::from_method(method).map(|op_type| Self::new(op_type, method, endpoint))
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry ceiling. Values below 1 are raised to 1.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }
}

/// A durable, pending mutation awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub op_type: OperationType,
    pub endpoint: String,
    pub method: HttpMethod,
    pub payload: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    /// Failed replay attempts so far.
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_retry_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    pub metadata: OperationMetadata,
}

impl QueuedOperation {
    /// Materialize a queued record from its input, assigning id and timestamp.
    pub fn from_new(op: NewOperation, now: OffsetDateTime) -> Self {
        Self {
            id: generate_operation_id(now),
            op_type: op.op_type,
            endpoint: op.endpoint,
            method: op.method,
            payload: op.payload,
            headers: op.headers,
            priority: op.priority,
            retry_count: 0,
            max_retries: op.max_retries.max(1),
            last_error: None,
            last_retry_time: None,
            enqueued_at: now,
            metadata: op.metadata,
        }
    }

    /// Whether one more failure would exhaust the retry budget.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

/// Build an operation id of the form `op_<unix millis>_<random>`.
///
/// Ids sort roughly by creation time and are unique within a process.
pub fn generate_operation_id(now: OffsetDateTime) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("op_{}_{}", millis, &random[..9])
}

/// Aggregate statistics over the operation queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    /// Operations never attempted.
    pub pending: u64,
    /// Operations with at least one failed replay.
    pub retrying: u64,
    pub by_type: BTreeMap<OperationType, u64>,
    pub by_priority: BTreeMap<Priority, u64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub oldest: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub newest: Option<OffsetDateTime>,
}
