//! Cursor store: per-side change-feed positions persisted between runs.
//!
//! Persists a `CursorStoreFile` JSON document at
//! `<home>/.cloudsync/cursors/<name>.json`.
//! Writes use the same atomic `.tmp` + rename pattern as the config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cloudsync_core::{Cursor, Side};

use crate::engine::SyncEngine;
use crate::error::{io_err, SyncError};

/// Side label (`local`, `remote`, `side-N`) → last consumed cursor.
pub type CursorMap = BTreeMap<String, Cursor>;

/// On-disk cursor store payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorStoreFile {
    pub saved_at: DateTime<Utc>,
    pub cursors: CursorMap,
}

impl CursorStoreFile {
    pub fn empty() -> Self {
        Self {
            saved_at: Utc::now(),
            cursors: CursorMap::new(),
        }
    }

    /// Capture every side's current cursor. Sides without one are omitted.
    pub fn from_engine(engine: &SyncEngine) -> Self {
        let cursors = engine
            .cursors()
            .into_iter()
            .filter_map(|(side, cursor)| cursor.map(|c| (side.to_string(), c)))
            .collect();
        Self {
            saved_at: Utc::now(),
            cursors,
        }
    }

    /// Hand stored cursors back to the engine. Unknown labels are skipped.
    pub fn restore_into(&self, engine: &SyncEngine) -> Result<usize, SyncError> {
        let mut restored = 0;
        for (label, cursor) in &self.cursors {
            let Some(side) = parse_side(label) else {
                tracing::warn!(label = %label, "ignoring cursor for unrecognised side label");
                continue;
            };
            engine.restore_cursor(side, cursor.clone())?;
            restored += 1;
        }
        Ok(restored)
    }
}

/// Inverse of `Side`'s `Display`.
pub fn parse_side(label: &str) -> Option<Side> {
    match label {
        "local" => Some(Side::LOCAL),
        "remote" => Some(Side::REMOTE),
        other => other.strip_prefix("side-")?.parse().ok().map(Side),
    }
}

/// Path to the cursor store JSON for a given sync name, rooted at `home`.
///
/// `~/.cloudsync/cursors/<name>.json`
pub fn store_path_at(home: &Path, name: &str) -> PathBuf {
    home.join(".cloudsync")
        .join("cursors")
        .join(format!("{name}.json"))
}

/// Load the cursor store for `name`.
///
/// Returns an empty store if the file does not yet exist; the engine then
/// walks every side on its first poll.
pub fn load_at(home: &Path, name: &str) -> Result<CursorStoreFile, SyncError> {
    let path = store_path_at(home, name);
    if !path.exists() {
        return Ok(CursorStoreFile::empty());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let store = serde_json::from_str(&contents)?;
    tracing::debug!(path = %path.display(), "cursor store loaded");
    Ok(store)
}

/// Save the cursor store for `name` atomically.
///
/// Writes to `<path>.tmp` then renames to `<path>`.
pub fn save_at(home: &Path, name: &str, store: &CursorStoreFile) -> Result<(), SyncError> {
    let path = store_path_at(home, name);
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid cursor store path"),
        ));
    };

    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(store)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }
    Ok(())
}
