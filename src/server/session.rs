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
    fs::{self, DirBuilder, File, OpenOptions, Permissions},
    io::Write,
    net::SocketAddr,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use log::*;
use slab::Slab;

use crate::constants::*;
use crate::errors::{MigrationError, MigrationResult};
use crate::protocol::{
    messages::{ContainerInfo, FileData, FileDataEnd, FileInfo, FolderInfo},
    validate_name, ResultCode,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// Session open, no folder announced yet.
    Idle,
    FolderReady,
    FileAnnounced,
    Receiving,
    Restoring,
    /// The restore ran; the session accepts nothing more.
    Finished,
}

fn out_of_order(request: &str, state: TransferState) -> MigrationError {
    MigrationError::Remote {
        code: ResultCode::OutOfOrder,
        message: format!("{} not allowed in state {:?}", request, state),
    }
}

/// The file whose data is currently streamed.
struct IncomingFile {
    path: PathBuf,
    mode: u32,
    size: u64,
    received: u64,
    output: Option<File>,
}

impl IncomingFile {
    fn open(&mut self) -> MigrationResult<&mut File> {
        let file = match self.output.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(self.mode)
                .open(&self.path)?,
        };
        Ok(self.output.insert(file))
    }
}

/// Transfer context of one migration. Every call of the protocol is
/// applied to the session it names; nothing is shared between sessions.
pub struct TransferSession {
    id: u32,
    container_id: String,
    image_root: PathBuf,
    folder: Option<PathBuf>,
    current: Option<IncomingFile>,
    state: TransferState,
    files_received: usize,
    bytes_received: u64,
}

impl TransferSession {
    pub fn new(id: u32, container_id: &str, image_root: &Path) -> Self {
        Self {
            id,
            container_id: container_id.to_string(),
            image_root: image_root.to_path_buf(),
            folder: None,
            current: None,
            state: TransferState::Idle,
            files_received: 0,
            bytes_received: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    pub fn files_received(&self) -> usize {
        self.files_received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Creates `<image root>/<name>`. An existing directory is an error so a
    /// repeated migration is never mistaken for a fresh one.
    pub fn announce_folder(&mut self, info: &FolderInfo) -> MigrationResult<&Path> {
        if self.state != TransferState::Idle {
            return Err(out_of_order("FolderInfo", self.state));
        }
        validate_name(&info.name)?;

        let path = self.image_root.join(&info.name);
        info!("[{}] [>>] Folder: {}", self.id, path.display());
        DirBuilder::new().mode(DEF_DIR_PERM).create(&path)?;

        self.state = TransferState::FolderReady;
        Ok(self.folder.insert(path).as_path())
    }

    /// Records the file the next data stream belongs to. No I/O happens here.
    pub fn announce_file(&mut self, info: &FileInfo) -> MigrationResult<()> {
        if self.state != TransferState::FolderReady {
            return Err(out_of_order("FileInfo", self.state));
        }
        validate_name(&info.name)?;

        let folder = self.folder.as_ref().ok_or_else(|| out_of_order("FileInfo", self.state))?;
        let mode = info.mode & MODE_PERM_MASK;
        info!("[{}] [>>] File: {} (mode {:o}, size {})", self.id, info.name, mode, info.size);

        self.current = Some(IncomingFile {
            path: folder.join(&info.name),
            mode,
            size: info.size,
            received: 0,
            output: None,
        });
        self.state = TransferState::FileAnnounced;
        Ok(())
    }

    /// Appends one chunk to the announced file, opening it on the first one.
    pub fn write_chunk(&mut self, chunk: &FileData) -> MigrationResult<()> {
        if !matches!(self.state, TransferState::FileAnnounced | TransferState::Receiving) {
            return Err(out_of_order("FileData", self.state));
        }
        if chunk.data.len() > MAX_CHUNK_SIZE {
            return Err(MigrationError::Remote {
                code: ResultCode::InvalidArgument,
                message: format!("chunk of {} bytes exceeds {}", chunk.data.len(), MAX_CHUNK_SIZE),
            });
        }

        let state = self.state;
        let current = self.current.as_mut().ok_or_else(|| out_of_order("FileData", state))?;
        let received = current.received + chunk.data.len() as u64;
        if received > current.size {
            return Err(MigrationError::Remote {
                code: ResultCode::SizeMismatch,
                message: format!("{} exceeds announced size {}", current.path.display(), current.size),
            });
        }

        current.open()?.write_all(&chunk.data)?;
        current.received = received;
        self.state = TransferState::Receiving;
        Ok(())
    }

    /// Closes the announced file and applies its mode. A stream without
    /// chunks still leaves an empty file behind.
    pub fn finish_file(&mut self, end: &FileDataEnd) -> MigrationResult<u64> {
        if !matches!(self.state, TransferState::FileAnnounced | TransferState::Receiving) {
            return Err(out_of_order("FileDataEnd", self.state));
        }
        let state = self.state;
        let mut current = self.current.take().ok_or_else(|| out_of_order("FileDataEnd", state))?;
        // The file slot is consumed even if the checks below fail.
        self.state = TransferState::FolderReady;

        let file = current.open()?;
        file.sync_all()?;
        drop(current.output.take());

        if current.received != end.total_size || current.received != current.size {
            return Err(MigrationError::Remote {
                code: ResultCode::SizeMismatch,
                message: format!(
                    "{}: received {} bytes, announced {}, stream reported {}",
                    current.path.display(), current.received, current.size, end.total_size
                ),
            });
        }

        // The umask applies at creation; set the announced bits explicitly.
        fs::set_permissions(&current.path, Permissions::from_mode(current.mode))?;

        self.files_received += 1;
        self.bytes_received += current.received;
        info!("[{}] [==] Received {} ({} bytes)", self.id, current.path.display(), current.received);
        Ok(current.received)
    }

    /// Moves to the terminal state and returns the directory to restore from.
    pub fn begin_restore(&mut self, info: &ContainerInfo) -> MigrationResult<PathBuf> {
        if self.state != TransferState::FolderReady {
            return Err(out_of_order("ContainerInfo", self.state));
        }
        let folder = self.folder.clone().ok_or_else(|| out_of_order("ContainerInfo", self.state))?;

        if info.name != self.container_id {
            warn!(
                "[{}] [==] Peer asked to restore {}, restoring {} as configured",
                self.id, info.name, self.container_id
            );
        }
        info!(
            "[{}] [==] Transfer complete: {} files, {} bytes",
            self.id, self.files_received, self.bytes_received
        );
        self.state = TransferState::Restoring;
        Ok(folder)
    }

    /// Marks the restore as done, whatever its result.
    pub fn finish(&mut self) {
        if self.state == TransferState::Restoring {
            self.state = TransferState::Finished;
        }
    }
}

/// A migration currently holding a slot on the server.
pub struct SessionEntry {
    pub peer: SocketAddr,
    pub container_id: String,
}

/// Bounds the number of migrations a server runs at once.
pub struct SessionTable {
    slab: Slab<SessionEntry>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self { slab: Slab::with_capacity(max_sessions), max_sessions }
    }

    /// Session ids start at 1; 0 marks a request sent before `Hello`.
    pub fn open(&mut self, peer: SocketAddr, container_id: &str) -> MigrationResult<u32> {
        if self.slab.len() >= self.max_sessions {
            let active: Vec<String> = self
                .slab
                .iter()
                .map(|(_, e)| format!("{} from {}", e.container_id, e.peer))
                .collect();
            return Err(MigrationError::Remote {
                code: ResultCode::Busy,
                message: format!("migration already in progress: {}", active.join(", ")),
            });
        }
        let key = self.slab.insert(SessionEntry { peer, container_id: container_id.to_string() });
        Ok(key as u32 + 1)
    }

    pub fn close(&mut self, id: u32) -> Option<SessionEntry> {
        let key = id.checked_sub(1)? as usize;
        self.slab.try_remove(key)
    }

    pub fn active(&self) -> usize {
        self.slab.len()
    }
}
