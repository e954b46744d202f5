//! Offline subsystem for the Chapel client.
//!
//! This crate keeps the application usable without network: reads are
//! served from a durable cache, mutations are queued and replayed when
//! connectivity returns, and the shell assets are precached at install.
//!
//! # Components
//!
//! | Component | Type | Role |
//! |-----------|------|------|
//! | Cache Store | [`CacheStore`] | durable endpoint to payload map |
//! | Operation Queue | [`OperationQueue`] | pending mutations, single-flight drain |
//! | Network Interceptor | [`NetworkInterceptor`] | routes calls to network, cache or queue |
//! | Sync Engine | [`SyncEngine`] | schedules drains, tracks stats, emits events |
//! | Background Trigger | [`BackgroundSyncService`] | best-effort deferred sync |
//! | Asset Cache | [`AssetPrecacher`] | versioned shell precache |
//!
//! All network access goes through the [`Transport`] trait. Enable the
//! `http` feature (on by default) for [`ReqwestTransport`]; tests use
//! [`MockTransport`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use chapel_core::{
//!     CacheStore, Connectivity, InterceptorConfig, MockTransport, NetworkInterceptor,
//!     OperationQueue, RequestOptions, SharedStore,
//! };
//! use chapel_store::Store;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: SharedStore = Arc::new(tokio::sync::Mutex::new(Store::open_in_memory()?));
//!     let transport = Arc::new(MockTransport::new());
//!     let connectivity = Connectivity::new(false);
//!
//!     let cache = CacheStore::new(store.clone());
//!     let queue = Arc::new(OperationQueue::new(store.clone(), transport.clone()));
//!     let interceptor = NetworkInterceptor::new(
//!         InterceptorConfig::default(),
//!         transport,
//!         cache,
//!         queue.clone(),
//!         connectivity,
//!     );
//!
//!     let resp = interceptor
//!         .request("/api/tasks/5", RequestOptions::put(json!({"status": "done"})))
//!         .await?;
//!     assert!(resp.offline);
//!     assert_eq!(queue.len().await?, 1);
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod mock;
pub mod precache;
pub mod queue;
pub mod retry;
pub mod sync;
pub mod transport;

use std::sync::Arc;

/// Storage handle shared by every component.
pub type SharedStore = Arc<tokio::sync::Mutex<chapel_store::Store>>;

pub use background::{
    BackgroundPlatform, BackgroundRunner, BackgroundSyncService, InProcessPlatform, NoopPlatform,
};
pub use cache::{CacheStore, cache_key};
pub use connectivity::{Connectivity, ConnectivityProbe};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender};
pub use interceptor::{InterceptedResponse, InterceptorConfig, NetworkInterceptor, RequestOptions};
pub use mock::MockTransport;
pub use precache::{
    AssetFailure, AssetPrecacher, DEFAULT_CACHE_VERSION, InstallReport, PrecacheManifest,
    ShellAsset,
};
pub use queue::{DrainReport, OperationQueue};
pub use retry::{RetryConfig, is_retryable, with_retry};
pub use sync::{MaintenancePolicy, SyncEngine, SyncOutcome, evaluate_gates};
#[cfg(feature = "http")]
pub use transport::ReqwestTransport;
pub use transport::{HttpRequest, HttpResponse, Transport};

// Re-export the data model for convenience
pub use chapel_types::{
    NewOperation, OperationType, Priority, QueuedOperation, SkipReason, SyncConfig, SyncEvent,
    SyncState, SyncStats, SyncTag,
};
