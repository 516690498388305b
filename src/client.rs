/*
 * Copyright (c) 2023 University of Oxford.
 * Copyright (c) 2023 Red Hat, Inc.
 * All rights reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::{
    fs::{self, File},
    io::{ErrorKind, Read},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use log::*;

use crate::config::Timeouts;
use crate::constants::*;
use crate::errors::{MigrationError, MigrationResult};
use crate::lifecycle::{ensure_checkpointable, DestroyGuard};
use crate::options::{CheckpointExtras, MigrationOptions};
use crate::protocol::{
    framing::{is_timeout, pb_read, pb_write},
    messages::{ContainerInfo, FileData, FileDataEnd, FileInfo, FolderInfo, Hello},
    validate_name, Kind, Request, Res, ResultCode,
};
use crate::runtime::ContainerRuntime;

/// How the destination answered the restore trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The destination reported the restored container's exit status.
    Exited(i32),
    /// The channel closed after the trigger was accepted.
    ChannelClosed,
    /// Nothing reported within the restore timeout; the restore goes on.
    StillRunning,
}

/// Client side of the file transfer service. Each method is one call and
/// waits for its reply.
pub struct TransferClient {
    tcp_stream: TcpStream,
    session_id: u32,
    timeouts: Timeouts,
}

impl TransferClient {
    /// Connects and opens a session for `container_id`.
    pub fn connect(address: &str, port: u16, container_id: &str, timeouts: Timeouts) -> MigrationResult<Self> {
        let server_address = format!("{address}:{port}");
        info!("Connecting to {server_address}");

        let socket_addr = server_address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| MigrationError::Config(format!("cannot resolve {server_address}")))?;
        let tcp_stream = TcpStream::connect_timeout(&socket_addr, timeouts.rpc).map_err(|e| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => MigrationError::Timeout(timeouts.rpc),
            _ => MigrationError::Io(e),
        })?;
        tcp_stream.set_nodelay(true)?;
        info!("Connected to server at {server_address}");

        let mut client = Self { tcp_stream, session_id: 0, timeouts };
        let res = client.call(Kind::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            container_id: container_id.to_string(),
        }))?;
        client.session_id = res.session_id;
        info!("Opened session {}", client.session_id);
        Ok(client)
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    fn send(&mut self, kind: Kind, timeout: Duration) -> MigrationResult<()> {
        self.tcp_stream.set_write_timeout(Some(timeout))?;
        pb_write(&mut self.tcp_stream, &Request::new(self.session_id, kind))
            .map(|_| ())
            .map_err(|e| timed(e, timeout))
    }

    /// Waits for one reply. `None` waits without bound.
    fn receive(&mut self, timeout: Option<Duration>) -> MigrationResult<Res> {
        self.tcp_stream.set_read_timeout(timeout)?;
        let res: Res = pb_read(&mut self.tcp_stream).map_err(|e| match timeout {
            Some(timeout) => timed(e, timeout),
            None => e,
        })?;

        let code = res.result_code();
        info!("return message: {} {}", code.as_str_name(), res.message);
        if !code.is_success() {
            return Err(MigrationError::Remote { code, message: res.message });
        }
        Ok(res)
    }

    fn call(&mut self, kind: Kind) -> MigrationResult<Res> {
        let timeout = self.timeouts.rpc;
        self.send(kind, timeout)?;
        self.receive(Some(timeout))
    }

    pub fn announce_folder(&mut self, name: &str) -> MigrationResult<Res> {
        self.call(Kind::Folder(FolderInfo { name: name.to_string() }))
    }

    pub fn announce_file(&mut self, name: &str, mode: u32, size: u64) -> MigrationResult<Res> {
        self.call(Kind::File(FileInfo { name: name.to_string(), mode, size }))
    }

    /// Streams `src` in chunks of at most `chunk_size` bytes and returns the
    /// number of bytes sent. Each chunk must go out within the progress
    /// timeout, so large files are bounded by liveness, not by total time.
    pub fn send_file_data<R: Read>(&mut self, src: &mut R, chunk_size: usize) -> MigrationResult<u64> {
        let chunk_size = chunk_size.min(MAX_CHUNK_SIZE).max(1);
        let progress = self.timeouts.progress;
        let mut buffer = vec![0u8; chunk_size];
        let mut total: u64 = 0;

        loop {
            let count = match src.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = self.send(Kind::Data(FileData { data: buffer[..count].to_vec() }), progress) {
                return Err(self.explain_broken_stream(e));
            }
            total += count as u64;
        }

        if let Err(e) = self.send(Kind::DataEnd(FileDataEnd { total_size: total }), progress) {
            return Err(self.explain_broken_stream(e));
        }
        self.receive(Some(self.timeouts.rpc))?;
        Ok(total)
    }

    /// The server replies and hangs up when it aborts a stream; prefer its
    /// reason over the write error it caused.
    fn explain_broken_stream(&mut self, error: MigrationError) -> MigrationError {
        match self.receive(Some(self.timeouts.rpc)) {
            Err(remote @ MigrationError::Remote { .. }) => remote,
            _ => error,
        }
    }

    /// Asks the destination to restore. The trigger must be accepted within
    /// the RPC timeout; the final report may take as long as the restored
    /// container runs.
    pub fn trigger_restore(&mut self, container_id: &str) -> MigrationResult<RestoreOutcome> {
        info!("containerid: {container_id}");
        let accepted = self.call(Kind::Restore(ContainerInfo { name: container_id.to_string() }))?;
        if accepted.result_code() != ResultCode::Accepted {
            return Err(MigrationError::Protocol(format!(
                "expected ACCEPTED, got {}", accepted.result_code().as_str_name()
            )));
        }

        match self.receive(self.timeouts.restore) {
            Ok(res) => match (res.result_code(), res.exit_status) {
                (ResultCode::Restored, Some(status)) => Ok(RestoreOutcome::Exited(status)),
                (code, _) => Err(MigrationError::Protocol(format!(
                    "expected RESTORED with an exit status, got {}", code.as_str_name()
                ))),
            },
            Err(MigrationError::ChannelClosed) => {
                warn!("Channel closed after the restore was accepted; exit status unknown");
                Ok(RestoreOutcome::ChannelClosed)
            }
            Err(MigrationError::Timeout(after)) => {
                warn!("No restore report after {after:?}; the destination keeps running the container");
                Ok(RestoreOutcome::StillRunning)
            }
            Err(e) => Err(e),
        }
    }

    pub fn close(self) {
        if let Err(e) = self.tcp_stream.shutdown(Shutdown::Both) {
            debug!("Failed to shutdown TCP connection: {e}");
        }
    }
}

fn timed(error: MigrationError, timeout: Duration) -> MigrationError {
    if is_timeout(&error) {
        MigrationError::Timeout(timeout)
    } else {
        error
    }
}

/// Where and how to migrate a container.
pub struct MigrationRequest<'a> {
    pub container_id: &'a str,
    pub address: &'a str,
    pub port: u16,
    pub options: &'a MigrationOptions,
    pub extras: &'a CheckpointExtras,
    pub timeouts: Timeouts,
    pub chunk_size: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MigrationReport {
    pub folder: String,
    pub files: usize,
    pub bytes: u64,
    pub skipped: Vec<PathBuf>,
    pub restore: RestoreOutcome,
}

/// A regular file of the image directory, in directory order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    pub mode: u32,
    pub size: u64,
}

/// Lists the files directly inside `images_dir`. Other entries (sockets left
/// by CRIU, nested directories) are returned separately and not transferred.
pub fn list_image_files(images_dir: &Path) -> MigrationResult<(Vec<ImageEntry>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut skipped = Vec::new();

    for entry in fs::read_dir(images_dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let name = match entry.file_name().into_string() {
            Ok(name) if metadata.is_file() => name,
            _ => {
                skipped.push(entry.path());
                continue;
            }
        };
        files.push(ImageEntry {
            name,
            mode: metadata.permissions().mode() & MODE_PERM_MASK,
            size: metadata.len(),
        });
    }
    Ok((files, skipped))
}

/// Name the image directory is announced under; it must be a single path
/// component the server accepts.
pub fn folder_name(images_dir: &Path) -> MigrationResult<String> {
    let unusable = || MigrationError::Config(format!(
        "image path {} has no usable directory name", images_dir.display()
    ));
    let name = images_dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(unusable)?;
    validate_name(name).map_err(|_| unusable())?;
    Ok(name.to_string())
}

/// Pushes an existing image directory to the destination and triggers the
/// restore there.
pub fn transfer_images(client: &mut TransferClient, container_id: &str, images_dir: &Path, chunk_size: usize) -> MigrationResult<MigrationReport> {
    let folder = folder_name(images_dir)?;
    client.announce_folder(&folder)?;

    let (files, skipped) = list_image_files(images_dir)?;
    for path in &skipped {
        warn!("Skipping {}: not a regular file", path.display());
    }

    let mut bytes = 0;
    for image in &files {
        client.announce_file(&image.name, image.mode, image.size)?;
        let mut src = File::open(images_dir.join(&image.name))?;
        let sent = client.send_file_data(&mut src, chunk_size)?;
        info!("Sent {} ({} bytes)", image.name, sent);
        bytes += sent;
    }

    let restore = client.trigger_restore(container_id)?;
    Ok(MigrationReport { folder, files: files.len(), bytes, skipped, restore })
}

/// Checkpoints the container, transfers its images and restores it on the
/// destination. The first failing step aborts the migration.
pub fn migrate(runtime: &dyn ContainerRuntime, request: &MigrationRequest<'_>) -> MigrationResult<MigrationReport> {
    // Checked before the runtime is touched: checkpoint stops the container.
    folder_name(&request.options.image_path)?;

    let status = ensure_checkpointable(runtime, request.container_id)?;
    info!("Container {} is {}", request.container_id, status);

    runtime.checkpoint(request.container_id, request.options, request.extras)?;

    // Once dumped, the local instance is superseded whatever happens next.
    let _destroy = if request.options.keeps_running(request.extras) {
        None
    } else {
        Some(DestroyGuard::new(runtime, request.container_id))
    };

    let mut client = TransferClient::connect(request.address, request.port, request.container_id, request.timeouts)?;
    let report = transfer_images(&mut client, request.container_id, &request.options.image_path, request.chunk_size)?;
    client.close();

    info!(
        "Migrated {} files ({} bytes) of {} into {}",
        report.files, report.bytes, request.container_id, report.folder
    );
    Ok(report)
}
