//! The capability contract every backend implements, the local filesystem
//! included. The sync engine is written against [`Provider`] only.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CloudError;
use crate::types::{ContentHash, Cursor, Event, ObjectInfo, Oid};

/// Free-form per-object metadata passed through to `create`.
pub type Metadata = BTreeMap<String, String>;

/// Static per-backend requirement flags plus the synchronized subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Root of the synchronized subtree on this backend.
    #[serde(default = "default_sync_root")]
    pub sync_root: String,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default = "default_true")]
    pub allow_renames_over_existing: bool,
    #[serde(default)]
    pub require_parent_folder: bool,
}

fn default_sync_root() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            sync_root: default_sync_root(),
            case_sensitive: true,
            allow_renames_over_existing: true,
            require_parent_folder: false,
        }
    }
}

impl ProviderConfig {
    pub fn with_sync_root(mut self, root: impl Into<String>) -> Self {
        self.sync_root = crate::paths::normalize(&root.into());
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn with_renames_over_existing(mut self, allow: bool) -> Self {
        self.allow_renames_over_existing = allow;
        self
    }

    pub fn with_require_parent_folder(mut self, require: bool) -> Self {
        self.require_parent_folder = require;
        self
    }
}

/// Opaque key/value credentials handed to [`Provider::connect`].
///
/// `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials(pub BTreeMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// One finite slice of a change feed and the cursor that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub events: Vec<Event>,
    /// Position after the last event in `events`. Equal to the request
    /// cursor when nothing changed.
    pub cursor: Cursor,
}

/// Operations every backend must provide.
///
/// Each mutating call fails with a [`CloudError`] kind; implementations must
/// never leak transport errors. Calls on one provider are serialized by the
/// caller, so implementations need not be internally synchronized.
pub trait Provider: Send {
    /// Registry name of this backend.
    fn name(&self) -> &str;

    fn config(&self) -> &ProviderConfig;

    /// Establish (or re-establish) a session.
    ///
    /// Fails with `Token` on invalid credentials, `Disconnected` on network
    /// failure.
    fn connect(&mut self, credentials: &Credentials) -> Result<(), CloudError>;

    fn connected(&self) -> bool;

    fn disconnect(&mut self);

    /// Cursor for "now": events after this point are future changes.
    fn current_cursor(&mut self) -> Result<Cursor, CloudError>;

    /// Next batch of changes after `cursor`.
    ///
    /// Finite per call and must not block past `timeout`, even when nothing
    /// changed. Fails with `InvalidCursor` when `cursor` is no longer valid.
    fn events(&mut self, cursor: &Cursor, timeout: Duration) -> Result<EventBatch, CloudError>;

    /// Current state of the sync root as synthetic "exists" events,
    /// optionally limited to objects modified at or after `since`.
    fn walk(&mut self, since: Option<f64>) -> Result<Vec<Event>, CloudError>;

    /// Replace the content of an existing file.
    fn upload(&mut self, oid: &Oid, content: &mut dyn Read) -> Result<ObjectInfo, CloudError>;

    /// Create a new file at `path`.
    fn create(
        &mut self,
        path: &str,
        content: &mut dyn Read,
        metadata: &Metadata,
    ) -> Result<ObjectInfo, CloudError>;

    fn download(&mut self, oid: &Oid, sink: &mut dyn Write) -> Result<(), CloudError>;

    /// Move an object; returns its oid afterwards, which some backends change.
    fn rename(&mut self, oid: &Oid, new_path: &str) -> Result<Oid, CloudError>;

    /// Create a directory; an existing directory at `path` is returned as-is.
    fn mkdir(&mut self, path: &str) -> Result<Oid, CloudError>;

    /// Delete an object. Deleting an absent oid is a no-op.
    fn delete(&mut self, oid: &Oid) -> Result<(), CloudError>;

    fn info_path(&mut self, path: &str) -> Result<Option<ObjectInfo>, CloudError>;

    fn info_oid(&mut self, oid: &Oid) -> Result<Option<ObjectInfo>, CloudError>;

    fn exists_path(&mut self, path: &str) -> Result<bool, CloudError> {
        Ok(self.info_path(path)?.is_some())
    }

    fn exists_oid(&mut self, oid: &Oid) -> Result<bool, CloudError> {
        Ok(self.info_oid(oid)?.is_some())
    }

    /// Immediate children of a directory.
    fn listdir(&mut self, oid: &Oid) -> Result<Vec<ObjectInfo>, CloudError>;

    /// This backend's content hash function, applied to arbitrary bytes.
    ///
    /// Lets the engine compare content across backends whose native digests
    /// differ. Defaults to SHA-256.
    fn hash_data(&self, data: &mut dyn Read) -> Result<ContentHash, CloudError> {
        let mut h = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = data
                .read(&mut buf)
                .map_err(|e| CloudError::Temporary(format!("reading content to hash: {e}")))?;
            if n == 0 {
                break;
            }
            h.update(&buf[..n]);
        }
        Ok(ContentHash(h.finalize().to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
