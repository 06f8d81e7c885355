//! Error types for cloudsync-sync.

use std::path::PathBuf;

use thiserror::Error;

use cloudsync_core::{CloudError, RegistryError, Side};

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A provider call failed and the failure was not absorbed.
    #[error("provider error: {0}")]
    Cloud(#[from] CloudError),

    /// An error from the provider registry or config.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (cursor store).
    #[error("cursor store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A provider broke its contract: malformed event, corrupted parent chain.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The side's credentials were rejected; its poller is stopped until
    /// new credentials are supplied.
    #[error("authentication failed on {side}: {reason}")]
    AuthFailed { side: Side, reason: String },

    #[error("no such side: {0}")]
    UnknownSide(Side),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
