//! Domain types exchanged at every provider boundary.
//!
//! Paths are provider paths (`/`-separated strings), never `PathBuf`: they
//! name objects on a backend, not on the local disk.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque, backend-stable object identifier. Survives renames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid(pub String);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Oid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Oid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque change-feed resumption token. Only compared, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Content digest as reported by one backend.
///
/// Digests from different backends are not assumed comparable; see
/// [`crate::Provider::hash_data`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub Vec<u8>);

impl ContentHash {
    /// SHA-256 of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(data);
        Self(h.finalize().to_vec())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<Vec<u8>> for ContentHash {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// One participant in synchronization, by position in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Side(pub usize);

impl Side {
    pub const LOCAL: Side = Side(0);
    pub const REMOTE: Side = Side(1);

    pub fn index(self) -> usize {
        self.0
    }

    pub fn is_local(self) -> bool {
        self == Side::LOCAL
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str("local"),
            1 => f.write_str("remote"),
            n => write!(f, "side-{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of object an event or snapshot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OType {
    File,
    Directory,
    #[default]
    Unknown,
}

impl fmt::Display for OType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OType::File => write!(f, "file"),
            OType::Directory => write!(f, "directory"),
            OType::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One observed change on one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub otype: OType,
    pub oid: Oid,
    /// Absent when the backend reports only an identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Always absent for directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    pub exists: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Event {
    pub fn new(
        otype: OType,
        oid: impl Into<Oid>,
        path: Option<String>,
        hash: Option<ContentHash>,
        exists: bool,
        timestamp: f64,
    ) -> Self {
        Self {
            otype,
            oid: oid.into(),
            path,
            hash,
            exists,
            timestamp,
        }
    }

    /// Synthetic "exists" event for a snapshot, as produced by a walk.
    pub fn from_info(info: &ObjectInfo, timestamp: f64) -> Self {
        Self {
            otype: info.resolved_type(),
            oid: info.oid.clone(),
            path: info.path.clone(),
            hash: info.hash.clone(),
            exists: true,
            timestamp,
        }
    }

    /// Type with the hash-presence rule applied: an unknown object that
    /// carries a hash is a file.
    pub fn resolved_type(&self) -> OType {
        match (self.otype, &self.hash) {
            (OType::Unknown, Some(_)) => OType::File,
            (otype, _) => otype,
        }
    }

    /// Checks the shape invariants every provider must honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.oid.0.is_empty() {
            return Err("event has an empty oid".to_string());
        }
        if self.otype == OType::Directory && self.hash.is_some() {
            return Err(format!("directory event for {} carries a hash", self.oid));
        }
        if !self.timestamp.is_finite() {
            return Err(format!("event for {} has a non-finite timestamp", self.oid));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ObjectInfo
// ---------------------------------------------------------------------------

/// A backend's authoritative description of one object at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub otype: OType,
    pub oid: Oid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Parent oid; the root is its own parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Oid>,
    /// Final path component, for backends that only know names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ObjectInfo {
    pub fn file(oid: impl Into<Oid>, hash: ContentHash, path: Option<String>) -> Self {
        Self {
            otype: OType::File,
            oid: oid.into(),
            hash: Some(hash),
            path,
            parent: None,
            name: None,
        }
    }

    pub fn directory(oid: impl Into<Oid>, path: Option<String>) -> Self {
        Self {
            otype: OType::Directory,
            oid: oid.into(),
            hash: None,
            path,
            parent: None,
            name: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<Oid>, name: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self.name = Some(name.into());
        self
    }

    /// Snapshots always carry a hash for files, so absence means directory.
    pub fn resolved_type(&self) -> OType {
        match (self.otype, &self.hash) {
            (OType::Unknown, Some(_)) => OType::File,
            (OType::Unknown, None) => OType::Directory,
            (otype, _) => otype,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.resolved_type() == OType::Directory
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
