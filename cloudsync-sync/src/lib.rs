//! # cloudsync-sync
//!
//! Bidirectional synchronization between cloud providers.
//!
//! Build a [`SyncEngine`] from one [`cloudsync_core::Provider`] per side and
//! call [`SyncEngine::run`]. Each cycle polls every side's change feed,
//! folds the events into the sync table and issues the provider operations
//! that bring the sides back into agreement.
//!
//! - [`event_manager`]: per-side change-feed poller
//! - [`path_cache`]: oid ↔ path cache with lazy resolution
//! - [`state`]: sync entries, states and the table
//! - [`engine`]: the reconciliation loop
//! - [`cursor_store`]: cursor persistence between runs

pub mod config;
pub mod cursor_store;
pub mod engine;
pub mod error;
pub mod event_manager;
pub mod path_cache;
pub mod retry;
pub mod state;

pub use config::EngineConfig;
pub use cursor_store::CursorStoreFile;
pub use engine::{RunOutcome, RunStats, SyncEngine};
pub use error::SyncError;
pub use event_manager::{EventManager, PollOutcome};
pub use path_cache::PathCache;
pub use retry::{with_retry, Backoff, RetryConfig};
pub use state::{EntryId, SideState, SyncEntry, SyncState, SyncTable};
