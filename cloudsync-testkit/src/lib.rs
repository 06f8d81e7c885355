//! # cloudsync testkit
//!
//! Test utilities for cloudsync.
//!
//! - [`MockProvider`]: an in-memory backend with fault injection, a
//!   controllable clock and call counters
//! - [`Harness`]: two mock sides wired into a [`cloudsync_sync::SyncEngine`]
//! - [`init_tracing`]: test log output, filtered by `RUST_LOG`

pub mod fixtures;
pub mod mock;

pub use fixtures::{init_tracing, mock_registry, test_engine_config, Harness};
pub use mock::{MockOp, MockProvider};
