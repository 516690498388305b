use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use criu_migration::{
    errors::MigrationError,
    options::{CheckpointExtras, MigrationOptions, RestoreExtras},
    runtime::{ContainerRuntime, ContainerStatus, RuncRuntime},
};

/// A stand-in OCI runtime that logs its arguments and answers like runc.
fn fake_runc(dir: &Path, log: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
printf '%s\n' "$*" >> '{log}'
case "$*" in
  *"state looper") echo '{{"ociVersion": "1.0.2", "id": "looper", "pid": 42, "status": "paused"}}' ;;
  *state*) echo "container does not exist" >&2; exit 1 ;;
  *restore*) exit 7 ;;
  *"checkpoint"*"broken") echo "criu failed: type NOTIFY errno 0" >&2; exit 1 ;;
esac
"#,
        log = log.display()
    );
    let path = dir.join("fake-runc");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn logged(log: &Path) -> Vec<String> {
    fs::read_to_string(log).unwrap().lines().map(str::to_string).collect()
}

// One test drives every subcommand so the script is never executed while
// another test thread still holds it open for writing.
#[test]
fn runc_runtime_drives_the_binary() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let binary = fake_runc(dir.path(), &log);
    let runtime = RuncRuntime::new(binary.to_str().unwrap(), Some(PathBuf::from("/run/fake")));

    assert_eq!(runtime.status("looper").unwrap(), ContainerStatus::Paused);
    assert!(matches!(runtime.status("ghost"), Err(MigrationError::ContainerNotFound(ref id)) if id == "ghost"));

    let options = MigrationOptions {
        image_path: PathBuf::from("/srv/images/checkpoint"),
        tcp_established: true,
        ..Default::default()
    };
    let extras = CheckpointExtras { page_server: Some("10.0.0.2:27".to_string()), ..Default::default() };
    runtime.checkpoint("looper", &options, &extras).unwrap();
    match runtime.checkpoint("broken", &options, &extras) {
        Err(MigrationError::Runtime(message)) => assert!(message.contains("criu failed"), "{message}"),
        other => panic!("expected a runtime error, got {other:?}"),
    }

    let bundle = dir.path().join("bundle");
    fs::create_dir(&bundle).unwrap();
    fs::write(bundle.join("config.json"), r#"{"ociVersion": "1.0.2", "root": {"path": "/rootfs"}}"#).unwrap();
    let spec = runtime.load_spec(&bundle).unwrap();
    assert_eq!(spec.root_path, Path::new("/rootfs"));

    let restore_extras = RestoreExtras { bundle: bundle.clone(), detach: true, ..Default::default() };
    assert_eq!(runtime.restore("looper", &spec, &options, &restore_extras).unwrap(), 7);

    runtime.destroy("looper").unwrap();

    assert_eq!(
        logged(&log),
        vec![
            "--root /run/fake state looper".to_string(),
            "--root /run/fake state ghost".to_string(),
            "--root /run/fake checkpoint --image-path /srv/images/checkpoint --tcp-established --page-server 10.0.0.2:27 looper".to_string(),
            "--root /run/fake checkpoint --image-path /srv/images/checkpoint --tcp-established --page-server 10.0.0.2:27 broken".to_string(),
            format!("--root /run/fake restore --image-path /srv/images/checkpoint --tcp-established --bundle {} --detach looper", bundle.display()),
            "--root /run/fake delete looper".to_string(),
        ]
    );

    let missing = RuncRuntime::new("/nonexistent/runc", None);
    assert!(matches!(missing.checkpoint("looper", &options, &extras), Err(MigrationError::Runtime(_))));
    assert!(matches!(missing.destroy("looper"), Err(MigrationError::Runtime(_))));
}
