use std::{
    ffi::OsString,
    fs,
    os::unix::{fs::symlink, net::UnixListener},
    path::{Path, PathBuf},
};

use criu_migration::{
    client::list_image_files,
    errors::MigrationError,
    lifecycle::{ensure_checkpointable, DestroyGuard, RestorePlan},
    options::{CgroupsMode, CheckpointExtras, MigrationOptions, RestoreExtras},
    runtime::{load_bundle_spec, ContainerStatus},
};
mod common;
use common::*;

fn args(list: &[&str]) -> Vec<OsString> {
    list.iter().map(OsString::from).collect()
}

#[test]
fn checkpoint_args_follow_the_options() {
    let options = MigrationOptions {
        image_path: PathBuf::from("/var/lib/images/looper"),
        work_path: Some(PathBuf::from("/tmp/work")),
        parent_path: Some(PathBuf::from("../pre")),
        tcp_established: true,
        shell_job: true,
        cgroups_mode: Some(CgroupsMode::Full),
        empty_ns: vec!["network".to_string(), "ipc".to_string()],
        ..Default::default()
    };
    let extras = CheckpointExtras {
        status_fd: Some(5),
        page_server: Some("10.0.0.2:27".to_string()),
        pre_dump: true,
    };

    assert_eq!(
        options.checkpoint_args(&extras),
        args(&[
            "--image-path", "/var/lib/images/looper",
            "--work-path", "/tmp/work",
            "--tcp-established",
            "--shell-job",
            "--manage-cgroups-mode", "full",
            "--empty-ns", "network",
            "--empty-ns", "ipc",
            "--parent-path", "../pre",
            "--status-fd", "5",
            "--page-server", "10.0.0.2:27",
            "--pre-dump",
        ])
    );
}

#[test]
fn default_options_only_name_the_image_path() {
    let options = MigrationOptions { image_path: PathBuf::from("checkpoint"), ..Default::default() };
    assert_eq!(options.checkpoint_args(&CheckpointExtras::default()), args(&["--image-path", "checkpoint"]));
}

#[test]
fn restore_args_carry_bundle_and_runtime_flags() {
    let options = MigrationOptions {
        image_path: PathBuf::from("/srv/images/checkpoint"),
        ext_unix_sk: true,
        file_locks: true,
        auto_dedup: true,
        ..Default::default()
    };
    let extras = RestoreExtras {
        bundle: PathBuf::from("/run/bundles/looper"),
        console_socket: Some(PathBuf::from("/run/console.sock")),
        detach: true,
        pid_file: Some(PathBuf::from("/run/looper.pid")),
        no_subreaper: false,
        no_pivot: true,
    };

    assert_eq!(
        options.restore_args(&extras),
        args(&[
            "--image-path", "/srv/images/checkpoint",
            "--ext-unix-sk",
            "--file-locks",
            "--auto-dedup",
            "--bundle", "/run/bundles/looper",
            "--console-socket", "/run/console.sock",
            "--detach",
            "--pid-file", "/run/looper.pid",
            "--no-pivot",
        ])
    );
}

#[test]
fn cgroups_mode_parses_known_modes_only() {
    for mode in ["soft", "full", "strict", "ignore"] {
        let parsed: CgroupsMode = mode.parse().unwrap();
        assert_eq!(parsed.to_string(), mode);
    }
    assert!(matches!("partial".parse::<CgroupsMode>(), Err(MigrationError::Config(_))));
}

#[test]
fn keeps_running_with_leave_running_or_pre_dump() {
    let mut options = MigrationOptions::default();
    assert!(!options.keeps_running(&CheckpointExtras::default()));
    assert!(options.keeps_running(&CheckpointExtras { pre_dump: true, ..Default::default() }));
    options.leave_running = true;
    assert!(options.keeps_running(&CheckpointExtras::default()));
}

#[test]
fn checkpointable_states() {
    let cases = [
        (ContainerStatus::Running, true),
        (ContainerStatus::Paused, true),
        (ContainerStatus::Creating, true),
        (ContainerStatus::Created, false),
        (ContainerStatus::Stopped, false),
    ];
    for (status, allowed) in cases {
        let runtime = FakeRuntime::new(Some(status), Vec::new(), 0);
        let result = ensure_checkpointable(&runtime, CONTAINER_ID);
        assert_eq!(result.is_ok(), allowed, "{status}");
        if !allowed {
            assert!(matches!(result, Err(MigrationError::InvalidState(_))));
        }
    }
}

#[test]
fn destroy_guard_destroys_on_drop() {
    let runtime = FakeRuntime::running(Vec::new());
    {
        let _guard = DestroyGuard::new(&runtime, CONTAINER_ID);
        assert!(runtime.calls().is_empty());
    }
    assert_eq!(runtime.calls(), vec!["destroy"]);
}

#[test]
fn restore_plan_uses_received_directory() {
    let options = MigrationOptions {
        image_path: PathBuf::from("/configured"),
        tcp_established: true,
        ..Default::default()
    };
    let extras = RestoreExtras { bundle: PathBuf::from("/run/bundles/looper"), ..Default::default() };
    let plan = RestorePlan::new(CONTAINER_ID, options, extras);
    let runtime = FakeRuntime::new(Some(ContainerStatus::Running), Vec::new(), 9);

    let received = Path::new("/srv/images/checkpoint-looper");
    let planned = plan.options_for(received);
    assert_eq!(planned.image_path, received);
    assert!(planned.tcp_established);

    assert_eq!(plan.execute(&runtime, received).unwrap(), 9);
    assert_eq!(runtime.calls(), vec!["load_spec", "restore"]);
    assert_eq!(runtime.restored_from().as_deref(), Some(received));
}

#[test]
fn bundle_spec_is_read_from_config_json() {
    let bundle = tempfile::tempdir().unwrap();
    fs::write(
        bundle.path().join("config.json"),
        r#"{"ociVersion": "1.0.2-dev", "root": {"path": "rootfs", "readonly": true}, "process": {"args": ["sh"]}}"#,
    )
    .unwrap();

    let spec = load_bundle_spec(bundle.path()).unwrap();
    assert_eq!(spec.oci_version, "1.0.2-dev");
    assert_eq!(spec.root_path, bundle.path().join("rootfs"));
    assert_eq!(spec.bundle, bundle.path());
}

#[test]
fn bundle_without_root_is_rejected() {
    let bundle = tempfile::tempdir().unwrap();
    assert!(matches!(load_bundle_spec(bundle.path()), Err(MigrationError::Runtime(_))));

    fs::write(bundle.path().join("config.json"), r#"{"ociVersion": "1.0.2"}"#).unwrap();
    assert!(matches!(load_bundle_spec(bundle.path()), Err(MigrationError::Runtime(_))));
}

#[test]
fn only_regular_files_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    write_images(dir.path(), &[
        ImageSpec { name: "core.img", size: 10, mode: 0o644 },
        ImageSpec { name: "pstree.img", size: 0, mode: 0o600 },
    ]);
    fs::create_dir(dir.path().join("nested")).unwrap();
    symlink(dir.path().join("core.img"), dir.path().join("link.img")).unwrap();
    let _socket = UnixListener::bind(dir.path().join("criu.sock")).unwrap();

    let (mut files, mut skipped) = list_image_files(dir.path()).unwrap();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    skipped.sort();

    let listed: Vec<(&str, u32, u64)> = files.iter().map(|f| (f.name.as_str(), f.mode, f.size)).collect();
    assert_eq!(listed, vec![("core.img", 0o644, 10), ("pstree.img", 0o600, 0)]);
    assert_eq!(
        skipped,
        vec![dir.path().join("criu.sock"), dir.path().join("link.img"), dir.path().join("nested")]
    );
}
