use std::process::{Command, Output};

mod common;
use common::*;

fn criu_migration(args: &[&str]) -> Output {
    let cwd = tempfile::tempdir().unwrap();
    Command::new(env!("CARGO_BIN_EXE_criu-migration"))
        .args(args)
        .current_dir(cwd.path())
        .env_remove("CRIU_MIGRATION_LOG_LEVEL")
        .output()
        .expect("failed to run criu-migration")
}

fn combined(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string() + &String::from_utf8_lossy(&out.stderr)
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[test]
fn completions_are_generated() {
    let out = criu_migration(&["completions", "bash"]);
    assert!(out.status.success(), "{}", combined(&out));
    assert!(String::from_utf8_lossy(&out.stdout).contains("criu-migration"));
}

#[test]
fn unknown_shell_is_rejected() {
    let out = criu_migration(&["completions", "tcsh"]);
    assert!(!out.status.success());
    assert!(combined(&out).contains("Invalid shell type"));
}

#[test]
fn legacy_command_names_are_accepted() {
    for alias in ["migrationcli", "migrationsrv", "c", "s"] {
        let out = criu_migration(&[alias, "--help"]);
        assert!(out.status.success(), "{alias}: {}", combined(&out));
    }
}

#[test]
fn invalid_log_level_is_reported_before_anything_runs() {
    let port = pick_port().to_string();
    let out = criu_migration(&["client", "looper", "127.0.0.1", &port, "--log-level", "loud"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(combined(&out).contains("invalid log_level"), "{}", combined(&out));
}

#[test]
fn commands_require_root() {
    if is_root() {
        println!("SKIPPING TEST: root check cannot be observed when running as root.");
        return;
    }

    let port = pick_port().to_string();
    for mode in ["client", "server"] {
        let out = criu_migration(&[mode, "looper", "127.0.0.1", &port]);
        assert_eq!(out.status.code(), Some(1), "{mode}");
        assert!(combined(&out).contains("requires root"), "{mode}: {}", combined(&out));
    }
}
