#![allow(dead_code)]

use std::{
    fs,
    net::{SocketAddr, TcpListener, TcpStream},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use criu_migration::{
    config::Timeouts,
    errors::{MigrationError, MigrationResult},
    lifecycle::RestorePlan,
    options::{CheckpointExtras, MigrationOptions, RestoreExtras},
    protocol::{
        framing::{pb_read, pb_write},
        Kind, Request, Res,
    },
    runtime::{ContainerRuntime, ContainerSpec, ContainerStatus},
    server::{Server, ServerContext},
};

pub const CONTAINER_ID: &str = "looper";

pub fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn test_timeouts() -> Timeouts {
    Timeouts {
        rpc: Duration::from_secs(5),
        progress: Duration::from_secs(5),
        restore: Some(Duration::from_secs(10)),
    }
}

/// One file a fake checkpoint leaves in the image directory.
#[derive(Clone)]
pub struct ImageSpec {
    pub name: &'static str,
    pub size: usize,
    pub mode: u32,
}

/// Deterministic, position dependent content so misplaced chunks show up.
pub fn image_content(name: &str, size: usize) -> Vec<u8> {
    let seed = name.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..size).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

pub fn write_images(dir: &Path, images: &[ImageSpec]) {
    fs::create_dir_all(dir).unwrap();
    for image in images {
        let path = dir.join(image.name);
        fs::write(&path, image_content(image.name, image.size)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(image.mode)).unwrap();
    }
}

pub fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

/// Stands in for the container runtime and records what it was asked to do.
pub struct FakeRuntime {
    pub status: Option<ContainerStatus>,
    pub images: Vec<ImageSpec>,
    pub exit_status: i32,
    pub fail_restore: bool,
    pub calls: Mutex<Vec<String>>,
    pub restored_from: Mutex<Option<PathBuf>>,
}

impl FakeRuntime {
    pub fn new(status: Option<ContainerStatus>, images: Vec<ImageSpec>, exit_status: i32) -> Self {
        Self {
            status,
            images,
            exit_status,
            fail_restore: false,
            calls: Mutex::new(Vec::new()),
            restored_from: Mutex::new(None),
        }
    }

    pub fn running(images: Vec<ImageSpec>) -> Self {
        Self::new(Some(ContainerStatus::Running), images, 0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn restored_from(&self) -> Option<PathBuf> {
        self.restored_from.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl ContainerRuntime for FakeRuntime {
    fn status(&self, container_id: &str) -> MigrationResult<ContainerStatus> {
        self.record("status");
        self.status.ok_or_else(|| MigrationError::ContainerNotFound(container_id.to_string()))
    }

    fn checkpoint(&self, _container_id: &str, options: &MigrationOptions, _extras: &CheckpointExtras) -> MigrationResult<()> {
        self.record("checkpoint");
        write_images(&options.image_path, &self.images);
        Ok(())
    }

    fn restore(&self, _container_id: &str, _spec: &ContainerSpec, options: &MigrationOptions, _extras: &RestoreExtras) -> MigrationResult<i32> {
        self.record("restore");
        *self.restored_from.lock().unwrap() = Some(options.image_path.clone());
        if self.fail_restore {
            return Err(MigrationError::Runtime("criu failed".to_string()));
        }
        Ok(self.exit_status)
    }

    fn destroy(&self, _container_id: &str) -> MigrationResult<()> {
        self.record("destroy");
        Ok(())
    }

    fn load_spec(&self, bundle: &Path) -> MigrationResult<ContainerSpec> {
        self.record("load_spec");
        Ok(ContainerSpec {
            bundle: bundle.to_path_buf(),
            oci_version: "1.0.2".to_string(),
            root_path: bundle.join("rootfs"),
        })
    }
}

/// Runs a transfer server on an ephemeral port.
pub fn start_server(image_root: &Path, runtime: Arc<FakeRuntime>, max_sessions: usize) -> (SocketAddr, JoinHandle<MigrationResult<i32>>) {
    let extras = RestoreExtras { bundle: PathBuf::from("/run/bundles/looper"), ..Default::default() };
    let plan = RestorePlan::new(CONTAINER_ID, MigrationOptions::default(), extras);
    let context = ServerContext::new(image_root, plan, runtime, test_timeouts(), max_sessions);

    let server = Server::bind("127.0.0.1", 0, context).expect("Failed to bind server");
    let addr = server.local_addr().unwrap();
    (addr, thread::spawn(move || server.serve()))
}

/// Speaks the wire protocol frame by frame, without the client's checks.
pub struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self { stream }
    }

    pub fn send(&mut self, session_id: u32, kind: Kind) {
        pb_write(&mut self.stream, &Request::new(session_id, kind)).unwrap();
    }

    pub fn read(&mut self) -> MigrationResult<Res> {
        pb_read(&mut self.stream)
    }

    pub fn request(&mut self, session_id: u32, kind: Kind) -> Res {
        self.send(session_id, kind);
        self.read().expect("no reply from server")
    }
}
