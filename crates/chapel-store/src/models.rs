//! Data models specific to storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A precached shell asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    /// Cache version this asset belongs to.
    pub cache_version: String,
    /// Request path (e.g. `/manifest.json`).
    pub path: String,
    /// Raw response body.
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
}
