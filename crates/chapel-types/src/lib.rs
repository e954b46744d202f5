//! Shared data model for the chapel offline-sync core.
//!
//! This crate holds the plain records passed between the store, the sync
//! core and the UI-facing service: cache entries, queued operations, sync
//! configuration and statistics, background registrations, connectivity
//! snapshots and the aggregated [`OfflineStatus`].
//!
//! # Example
//!
//! ```
//! use chapel_types::{HttpMethod, NewOperation, Priority};
//! use serde_json::json;
//!
//! let op = NewOperation::for_request(HttpMethod::Put, "/api/tasks/5")
//!     .expect("PUT is a mutation")
//!     .payload(json!({"status": "done"}))
//!     .priority(Priority::Normal);
//! assert_eq!(op.endpoint, "/api/tasks/5");
//! ```

pub mod error;
pub mod network;
pub mod status;
pub mod sync;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use network::{BatteryInfo, ConnectionType, NetworkSnapshot};
pub use status::{OfflineCondition, OfflineStatus};
pub use sync::{
    BackgroundSyncRegistration, RegistrationStatus, SkipReason, SyncConfig, SyncEvent, SyncState,
    SyncStats, SyncTag,
};
pub use types::{
    CacheEntry, CacheStats, DEFAULT_MAX_RETRIES, HttpMethod, NewOperation, OperationMetadata,
    OperationType, Priority, QueueStats, QueuedOperation, generate_operation_id,
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_priority_roundtrips_through_text(rank in 1u8..=3) {
            let priority = Priority::try_from(rank).unwrap();
            prop_assert_eq!(priority.to_string().parse::<Priority>().unwrap(), priority);
            prop_assert_eq!(priority.rank(), rank);
        }

        #[test]
        fn prop_method_parse_never_panics(s in "\\PC{0,12}") {
            let _ = s.parse::<HttpMethod>();
        }
    }
}
