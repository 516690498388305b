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

//! Checks and cleanup that bound a migration on either side.

use std::path::{Path, PathBuf};

use log::*;

use crate::errors::{MigrationError, MigrationResult};
use crate::options::{MigrationOptions, RestoreExtras};
use crate::runtime::{ContainerRuntime, ContainerStatus};

/// Fails unless the container exists and has a running process to dump.
pub fn ensure_checkpointable(runtime: &dyn ContainerRuntime, container_id: &str) -> MigrationResult<ContainerStatus> {
    let status = runtime.status(container_id)?;
    match status {
        ContainerStatus::Created | ContainerStatus::Stopped => Err(MigrationError::InvalidState(format!(
            "Container cannot be checkpointed in {} state", status
        ))),
        _ => Ok(status),
    }
}

/// Destroys the local container when dropped. Created once the checkpoint
/// succeeded, so the local instance is dropped whatever the transfer does.
pub struct DestroyGuard<'a> {
    runtime: &'a dyn ContainerRuntime,
    container_id: String,
}

impl<'a> DestroyGuard<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, container_id: &str) -> Self {
        Self { runtime, container_id: container_id.to_string() }
    }
}

impl Drop for DestroyGuard<'_> {
    fn drop(&mut self) {
        info!("Destroying local container {}", self.container_id);
        if let Err(e) = self.runtime.destroy(&self.container_id) {
            error!("Failed to destroy container {}: {}", self.container_id, e);
        }
    }
}

/// Everything the destination needs to restore, taken from its own
/// configuration rather than from the peer.
#[derive(Clone, Debug)]
pub struct RestorePlan {
    pub container_id: String,
    pub options: MigrationOptions,
    pub extras: RestoreExtras,
}

impl RestorePlan {
    pub fn new(container_id: &str, options: MigrationOptions, extras: RestoreExtras) -> Self {
        Self { container_id: container_id.to_string(), options, extras }
    }

    /// Options for restoring from `images_dir`, the directory the transfer
    /// materialized.
    pub fn options_for(&self, images_dir: &Path) -> MigrationOptions {
        MigrationOptions {
            image_path: images_dir.to_path_buf(),
            ..self.options.clone()
        }
    }

    /// Loads the bundle spec and runs the restore. Returns the exit status
    /// of the restored container.
    pub fn execute(&self, runtime: &dyn ContainerRuntime, images_dir: &Path) -> MigrationResult<i32> {
        let spec = runtime.load_spec(&self.bundle())?;
        let options = self.options_for(images_dir);
        runtime.restore(&self.container_id, &spec, &options, &self.extras)
    }

    fn bundle(&self) -> PathBuf {
        self.extras.bundle.clone()
    }
}
