//! YAML sync configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.cloudsync/
//!   cloudsync.yaml   (mode 0600)
//!   cursors/         (owned by cloudsync-sync)
//! ```
//!
//! # API pattern
//!
//! Every persistence function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::provider::{Provider, ProviderConfig};
use crate::registry::ProviderRegistry;

pub const CONFIG_VERSION: u32 = 1;

/// One side of the synchronization: which backend, configured how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideConfig {
    /// Registry name of the backend.
    pub provider: String,
    #[serde(default)]
    pub config: ProviderConfig,
}

/// Engine tunables as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_budget_ms")]
    pub poll_budget_ms: u64,
    #[serde(default = "default_tombstone_grace_secs")]
    pub tombstone_grace_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    250
}
fn default_poll_budget_ms() -> u64 {
    1_000
}
fn default_tombstone_grace_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_initial_delay_ms() -> u64 {
    100
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_budget_ms: default_poll_budget_ms(),
            tombstone_grace_secs: default_tombstone_grace_secs(),
            max_attempts: default_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
        }
    }
}

/// Root of the YAML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub version: u32,
    /// Side 0 is the local side by convention.
    #[serde(default)]
    pub sides: Vec<SideConfig>,
    #[serde(default)]
    pub engine: EngineSettings,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfig {
    pub fn new(sides: Vec<SideConfig>) -> Self {
        Self {
            version: CONFIG_VERSION,
            sides,
            engine: EngineSettings::default(),
            updated_at: Utc::now(),
        }
    }

    /// Construct one provider per configured side, in side order.
    pub fn build_providers(
        &self,
        registry: &ProviderRegistry,
    ) -> Result<Vec<Box<dyn Provider>>, RegistryError> {
        self.sides
            .iter()
            .map(|side| registry.create(&side.provider, side.config.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.cloudsync/`
pub fn config_dir_at(home: &Path) -> PathBuf {
    home.join(".cloudsync")
}

/// `<home>/.cloudsync/cloudsync.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    config_dir_at(home).join("cloudsync.yaml")
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load the configuration.
///
/// Returns `RegistryError::ConfigNotFound` if absent,
/// `RegistryError::Parse` (with path context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<SyncConfig, RegistryError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(RegistryError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, RegistryError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the configuration.
///
/// Serialized to a `.yaml.tmp` sibling, restricted to 0600, then renamed
/// over the target.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<(), RegistryError> {
    let dir = config_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("cloudsync.yaml.tmp");

    let mut stamped = config.clone();
    stamped.updated_at = Utc::now();
    let yaml = serde_yaml::to_string(&stamped)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    tracing::debug!(path = %path.display(), sides = config.sides.len(), "configuration saved");
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<(), RegistryError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn two_sides() -> SyncConfig {
        SyncConfig::new(vec![
            SideConfig {
                provider: "filesystem".to_string(),
                config: ProviderConfig::default().with_sync_root("/home/me/Drive"),
            },
            SideConfig {
                provider: "gdrive".to_string(),
                config: ProviderConfig::default()
                    .with_sync_root("/cloudsync")
                    .with_case_sensitive(false)
                    .with_renames_over_existing(false)
                    .with_require_parent_folder(true),
            },
        ])
    }

    #[test]
    fn config_path_is_correct() {
        let home = TempDir::new().expect("tempdir");
        assert!(config_path_at(home.path()).ends_with(".cloudsync/cloudsync.yaml"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = TempDir::new().expect("tempdir");
        let cfg = two_sides();
        save_at(home.path(), &cfg).expect("save");
        let loaded = load_at(home.path()).expect("load");
        assert_eq!(loaded.sides, cfg.sides);
        assert_eq!(loaded.engine, EngineSettings::default());
    }

    #[test]
    fn save_sets_file_permissions() {
        let home = TempDir::new().expect("tempdir");
        save_at(home.path(), &two_sides()).expect("save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(config_path_at(home.path()))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn load_missing_returns_not_found() {
        let home = TempDir::new().expect("tempdir");
        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(err, RegistryError::ConfigNotFound { .. }));
    }

    #[test]
    fn engine_settings_fill_defaults() {
        let yaml =
            "version: 1\nupdated_at: 2024-01-01T00:00:00Z\nengine:\n  poll_interval_ms: 50\n";
        let cfg: SyncConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.engine.poll_interval_ms, 50);
        assert_eq!(cfg.engine.tombstone_grace_secs, 30);
        assert!(cfg.sides.is_empty());
    }
}
