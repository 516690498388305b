use std::{env, fs, time::Duration};

use criu_migration::{
    config::{Settings, Timeouts},
    constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE},
    errors::MigrationError,
};
use log::LevelFilter;

#[test]
fn defaults_are_valid() {
    let settings = Settings::default();
    settings.validate().unwrap();

    assert_eq!(settings.runtime, "runc");
    assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
    assert_eq!(settings.max_sessions, 1);
    assert_eq!(settings.log_file, "-");
    assert_eq!(settings.level_filter().unwrap(), LevelFilter::Info);
    assert_eq!(Timeouts::default().restore, None);
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("criu-migration.json");
    fs::write(
        &path,
        r#"{
            "runtime": "crun",
            "runtime_root": "/run/crun",
            "rpc_timeout_secs": 3,
            "progress_timeout_secs": 7,
            "chunk_size": 65536,
            "log_level": "debug"
        }"#,
    )
    .unwrap();

    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings.runtime, "crun");
    assert_eq!(settings.runtime_root.as_deref(), Some(std::path::Path::new("/run/crun")));
    assert_eq!(settings.chunk_size, 65536);
    assert_eq!(settings.level_filter().unwrap(), LevelFilter::Debug);

    let timeouts = settings.timeouts();
    assert_eq!(timeouts.rpc, Duration::from_secs(3));
    assert_eq!(timeouts.progress, Duration::from_secs(7));
}

#[test]
fn environment_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(&path, r#"{"restore_timeout_secs": 5}"#).unwrap();

    env::set_var("CRIU_MIGRATION_RESTORE_TIMEOUT_SECS", "45");
    let settings = Settings::load(Some(&path));
    env::remove_var("CRIU_MIGRATION_RESTORE_TIMEOUT_SECS");

    assert_eq!(settings.unwrap().timeouts().restore, Some(Duration::from_secs(45)));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Settings::load(Some(&dir.path().join("absent.json"))).unwrap_err();
    assert!(matches!(err, MigrationError::Config(_)), "{err:?}");
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(&path, r#"{"chunk_size": "#).unwrap();
    assert!(matches!(Settings::load(Some(&path)), Err(MigrationError::Config(_))));
}

#[test]
fn invalid_values_are_rejected() {
    let invalid = [
        Settings { chunk_size: 0, ..Default::default() },
        Settings { chunk_size: MAX_CHUNK_SIZE + 1, ..Default::default() },
        Settings { rpc_timeout_secs: 0, ..Default::default() },
        Settings { progress_timeout_secs: 0, ..Default::default() },
        Settings { restore_timeout_secs: Some(0), ..Default::default() },
        Settings { max_sessions: 0, ..Default::default() },
        Settings { runtime: String::new(), ..Default::default() },
        Settings { log_level: "loud".to_string(), ..Default::default() },
    ];
    for settings in invalid {
        assert!(matches!(settings.validate(), Err(MigrationError::Config(_))), "{settings:?}");
    }
}

#[test]
fn invalid_file_values_fail_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(&path, r#"{"max_sessions": 0}"#).unwrap();
    assert!(matches!(Settings::load(Some(&path)), Err(MigrationError::Config(_))));
}
