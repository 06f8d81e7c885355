//! Error types for cloudsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// Failures a provider may report for any contract operation.
///
/// Backends translate their transport exceptions into one of these kinds;
/// nothing above the provider ever sees a raw transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// Credentials are invalid or expired. Not retried automatically.
    #[error("token invalid or expired: {0}")]
    Token(String),

    /// Transport or timeout failure; the side must reconnect.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Rate limiting or an unspecified server fault.
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// Target oid or path is absent.
    #[error("not found: {0}")]
    FileNotFound(String),

    /// A create or rename target is already taken.
    #[error("already exists: {0}")]
    FileExists(String),

    /// The change-feed cursor is no longer accepted by the backend.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

impl CloudError {
    /// Worth retrying at the call site with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Temporary(_))
    }

    /// Recovered by reconnecting the side, not by the state machine.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, CloudError::Disconnected(_))
    }
}

/// Errors from the provider registry and configuration persistence.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No constructor registered under this name.
    #[error("{name} is not a registered provider (known: {})", known.join(", "))]
    UnknownProvider { name: String, known: Vec<String> },

    /// A constructor was already registered under this name.
    #[error("provider {0} is already registered")]
    DuplicateProvider(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The configuration file did not exist at the expected path.
    #[error("config not found at {path}")]
    ConfigNotFound { path: PathBuf },
}
