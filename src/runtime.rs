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

//! This module is the boundary to the container runtime that performs the
//! actual checkpoint and restore.

use std::{
    ffi::OsString,
    fmt, fs,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    str::FromStr,
};

use log::*;

use crate::errors::{MigrationError, MigrationResult};
use crate::options::{CheckpointExtras, MigrationOptions, RestoreExtras};

/// Lifecycle states reported by an OCI runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
}

impl FromStr for ContainerStatus {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(ContainerStatus::Creating),
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "paused" => Ok(ContainerStatus::Paused),
            "stopped" => Ok(ContainerStatus::Stopped),
            other => Err(MigrationError::Runtime(format!("unknown container status {:?}", other))),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContainerStatus::Creating => "creating",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
        })
    }
}

/// The parts of an OCI bundle the restore needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerSpec {
    pub bundle: PathBuf,
    pub oci_version: String,
    pub root_path: PathBuf,
}

pub trait ContainerRuntime: Send + Sync {
    fn status(&self, container_id: &str) -> MigrationResult<ContainerStatus>;

    fn checkpoint(&self, container_id: &str, options: &MigrationOptions, extras: &CheckpointExtras) -> MigrationResult<()>;

    /// Returns the exit status of the restored container.
    fn restore(&self, container_id: &str, spec: &ContainerSpec, options: &MigrationOptions, extras: &RestoreExtras) -> MigrationResult<i32>;

    /// Removes the local bookkeeping of a container.
    fn destroy(&self, container_id: &str) -> MigrationResult<()>;

    fn load_spec(&self, bundle: &Path) -> MigrationResult<ContainerSpec>;
}

/// Reads `config.json` of an OCI bundle.
pub fn load_bundle_spec(bundle: &Path) -> MigrationResult<ContainerSpec> {
    let config_path = bundle.join("config.json");
    let text = fs::read_to_string(&config_path).map_err(|e| {
        MigrationError::Runtime(format!("failed to load spec {}: {}", config_path.display(), e))
    })?;
    let spec = json::parse(&text).map_err(|e| {
        MigrationError::Runtime(format!("invalid spec {}: {}", config_path.display(), e))
    })?;

    let oci_version = spec["ociVersion"]
        .as_str()
        .ok_or_else(|| MigrationError::Runtime("spec has no ociVersion".to_string()))?;
    let root_path = spec["root"]["path"]
        .as_str()
        .ok_or_else(|| MigrationError::Runtime("spec has no root.path".to_string()))?;

    let root_path = PathBuf::from(root_path);
    let root_path = if root_path.is_absolute() { root_path } else { bundle.join(root_path) };

    Ok(ContainerSpec {
        bundle: bundle.to_path_buf(),
        oci_version: oci_version.to_string(),
        root_path,
    })
}

/// Drives an OCI runtime binary such as `runc`.
pub struct RuncRuntime {
    binary: String,
    root: Option<PathBuf>,
}

impl RuncRuntime {
    pub fn new(binary: &str, root: Option<PathBuf>) -> Self {
        Self { binary: binary.to_string(), root }
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd.arg(subcommand);
        cmd
    }

    fn run(&self, subcommand: &str, args: Vec<OsString>, container_id: &str) -> MigrationResult<Output> {
        let mut cmd = self.command(subcommand);
        cmd.args(args).arg(container_id);
        debug!("Running {:?}", cmd);

        let output = cmd.output().map_err(|e| {
            MigrationError::Runtime(format!("failed to run {} {}: {}", self.binary, subcommand, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MigrationError::Runtime(format!(
                "{} {} {} failed ({}): {}", self.binary, subcommand, container_id, output.status, stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl ContainerRuntime for RuncRuntime {
    fn status(&self, container_id: &str) -> MigrationResult<ContainerStatus> {
        let output = self
            .run("state", Vec::new(), container_id)
            .map_err(|_| MigrationError::ContainerNotFound(container_id.to_string()))?;

        let state = json::parse(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| MigrationError::Runtime(format!("invalid state of {}: {}", container_id, e)))?;

        state["status"]
            .as_str()
            .ok_or_else(|| MigrationError::Runtime(format!("state of {} has no status", container_id)))?
            .parse()
    }

    fn checkpoint(&self, container_id: &str, options: &MigrationOptions, extras: &CheckpointExtras) -> MigrationResult<()> {
        info!("Checkpointing {} into {}", container_id, options.image_path.display());
        self.run("checkpoint", options.checkpoint_args(extras), container_id)?;
        Ok(())
    }

    fn restore(&self, container_id: &str, spec: &ContainerSpec, options: &MigrationOptions, extras: &RestoreExtras) -> MigrationResult<i32> {
        info!("Restoring {} from {} (bundle {})", container_id, options.image_path.display(), spec.bundle.display());

        let mut cmd = self.command("restore");
        cmd.args(options.restore_args(extras))
            .arg(container_id)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // In foreground mode the runtime exits with the container's status.
        let status = cmd.status().map_err(|e| {
            MigrationError::Runtime(format!("failed to run {} restore: {}", self.binary, e))
        })?;

        status.code().ok_or_else(|| {
            MigrationError::Runtime(format!("{} restore terminated by signal", self.binary))
        })
    }

    fn destroy(&self, container_id: &str) -> MigrationResult<()> {
        self.run("delete", Vec::new(), container_id)?;
        Ok(())
    }

    fn load_spec(&self, bundle: &Path) -> MigrationResult<ContainerSpec> {
        load_bundle_spec(bundle)
    }
}
