//! Snapshot consumed by the UI layer.

use serde::{Deserialize, Serialize};

use crate::sync::{BackgroundSyncRegistration, SyncConfig, SyncState, SyncStats};
use crate::types::{CacheStats, QueueStats};

/// Everything a UI needs to render offline state without hidden failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineStatus {
    pub is_online: bool,
    pub interceptor_enabled: bool,
    pub cache: CacheStats,
    pub queue: QueueStats,
    pub sync_state: SyncState,
    pub sync_stats: SyncStats,
    pub sync_config: SyncConfig,
    pub background_supported: bool,
    pub registrations: Vec<BackgroundSyncRegistration>,
}

/// Coarse user-facing condition derived from an [`OfflineStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineCondition {
    Online,
    OfflineWithCache,
    OfflineNoData,
}

impl OfflineStatus {
    pub fn condition(&self) -> OfflineCondition {
        if self.is_online {
            OfflineCondition::Online
        } else if self.cache.total_items > 0 {
            OfflineCondition::OfflineWithCache
        } else {
            OfflineCondition::OfflineNoData
        }
    }

    /// Operations waiting for replay.
    pub fn pending_operations(&self) -> u64 {
        self.queue.total
    }

    /// Operations dropped after exhausting their retries.
    pub fn permanently_failed(&self) -> u64 {
        self.sync_stats.exhausted_operations
    }
}
