//! Durable local storage for the chapel offline-sync core.
//!
//! This crate provides SQLite-based storage with four named collections:
//!
//! - **cache entries**: last known response per normalized endpoint
//! - **operation queue**: pending mutations with retry metadata
//! - **metadata**: arbitrary JSON values (sync stats, last download times)
//! - **asset cache**: install-time shell assets, one set per cache version
//!
//! # Example
//!
//! ```no_run
//! use chapel_store::{QueueQuery, Store};
//!
//! let store = Store::open_default()?;
//!
//! let pending = store.query_operations(&QueueQuery::new().limit(10))?;
//! println!("{} operations waiting", pending.len());
//! # Ok::<(), chapel_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::StoredAsset;
pub use queries::QueueQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/chapel/offline.db`
/// - macOS: `~/Library/Application Support/chapel/offline.db`
/// - Windows: `C:\Users\<user>\AppData\Local\chapel\offline.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("chapel")
        .join("offline.db")
}
