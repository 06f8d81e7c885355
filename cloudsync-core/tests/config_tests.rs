//! Config error-message, atomic-write-safety, and provider-building tests.
//! Storage: ~/.cloudsync/cloudsync.yaml

use assert_fs::prelude::*;
use cloudsync_core::{
    config::{self, EngineSettings, SideConfig, SyncConfig},
    ProviderConfig, ProviderRegistry, RegistryError,
};
use predicates::prelude::predicate;
use std::fs;

fn sample() -> SyncConfig {
    SyncConfig::new(vec![
        SideConfig {
            provider: "filesystem".to_string(),
            config: ProviderConfig::default().with_sync_root("/home/me/Sync"),
        },
        SideConfig {
            provider: "gdrive".to_string(),
            config: ProviderConfig::default()
                .with_case_sensitive(false)
                .with_require_parent_folder(true),
        },
    ])
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, RegistryError::ConfigNotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("config not found"));
    assert!(err.to_string().contains("cloudsync.yaml"));
}

#[test]
fn unparseable_config_names_its_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".cloudsync/cloudsync.yaml")
        .write_binary(b": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
    let msg = err.to_string();
    assert!(msg.contains("cloudsync.yaml"), "must contain file path, got: {msg}");
}

#[test]
fn load_wrong_shape_returns_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".cloudsync/cloudsync.yaml")
        .write_str("- this is a list, not a mapping\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_leaves_no_temporary_sibling() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &sample()).expect("save");

    home.child(".cloudsync/cloudsync.yaml")
        .assert(predicate::path::exists());
    home.child(".cloudsync/cloudsync.yaml.tmp")
        .assert(predicate::path::missing());
}

#[test]
fn stale_temporary_file_does_not_shadow_config() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &sample()).expect("save");

    let path = config::config_path_at(home.path());
    let original_bytes = fs::read(&path).expect("read original");

    // A save that died between write and rename.
    let tmp = path.with_file_name("cloudsync.yaml.tmp");
    fs::write(&tmp, b"sides: [").expect("write partial tmp");

    let loaded = config::load_at(home.path()).expect("load after crash");
    assert_eq!(loaded.sides, sample().sides);
    assert_eq!(original_bytes, fs::read(&path).expect("read after crash"));
}

#[test]
fn saved_yaml_contains_side_flags() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &sample()).expect("save");
    home.child(".cloudsync/cloudsync.yaml")
        .assert(predicate::str::contains("require_parent_folder: true"))
        .assert(predicate::str::contains("provider: gdrive"));
}

#[test]
fn save_overwrites_previous_engine_settings() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut cfg = sample();
    config::save_at(home.path(), &cfg).expect("first save");

    cfg.engine = EngineSettings {
        poll_interval_ms: 10,
        ..EngineSettings::default()
    };
    config::save_at(home.path(), &cfg).expect("second save");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.engine.poll_interval_ms, 10);
}

// ---------------------------------------------------------------------------
// 3. Building providers from config
// ---------------------------------------------------------------------------

#[test]
fn build_providers_fails_on_unregistered_backend() {
    let registry = ProviderRegistry::new();
    let err = sample().build_providers(&registry).err().expect("error");
    assert!(matches!(err, RegistryError::UnknownProvider { ref name, .. } if name == "filesystem"));
}

#[test]
fn build_providers_with_no_sides_is_empty() {
    let registry = ProviderRegistry::new();
    let built = SyncConfig::new(vec![])
        .build_providers(&registry)
        .expect("build");
    assert!(built.is_empty());
}
