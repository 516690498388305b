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

//! Checkpoint/restore tuning handed unchanged to the container runtime.

use std::{ffi::OsString, fmt, path::PathBuf, str::FromStr};

use crate::errors::MigrationError;

/// How CRIU handles the container's cgroups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgroupsMode {
    Soft,
    Full,
    Strict,
    Ignore,
}

impl FromStr for CgroupsMode {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soft" => Ok(CgroupsMode::Soft),
            "full" => Ok(CgroupsMode::Full),
            "strict" => Ok(CgroupsMode::Strict),
            "ignore" => Ok(CgroupsMode::Ignore),
            other => Err(MigrationError::Config(format!(
                "invalid manage-cgroups-mode {:?}: expected soft, full, strict or ignore", other
            ))),
        }
    }
}

impl fmt::Display for CgroupsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CgroupsMode::Soft => "soft",
            CgroupsMode::Full => "full",
            CgroupsMode::Strict => "strict",
            CgroupsMode::Ignore => "ignore",
        })
    }
}

/// Options shared by checkpoint and restore. Both sides build the same
/// structure so that restore sees options compatible with the dump.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MigrationOptions {
    pub image_path: PathBuf,
    pub work_path: Option<PathBuf>,
    pub parent_path: Option<PathBuf>,
    pub leave_running: bool,
    pub tcp_established: bool,
    pub ext_unix_sk: bool,
    pub shell_job: bool,
    pub lazy_pages: bool,
    pub file_locks: bool,
    pub cgroups_mode: Option<CgroupsMode>,
    pub empty_ns: Vec<String>,
    pub auto_dedup: bool,
    pub track_mem: bool,
}

/// Checkpoint-only passthroughs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckpointExtras {
    pub status_fd: Option<i32>,
    pub page_server: Option<String>,
    pub pre_dump: bool,
}

/// Restore-only settings of the destination host.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreExtras {
    pub bundle: PathBuf,
    pub console_socket: Option<PathBuf>,
    pub detach: bool,
    pub pid_file: Option<PathBuf>,
    pub no_subreaper: bool,
    pub no_pivot: bool,
}

fn push_flag(args: &mut Vec<OsString>, enabled: bool, flag: &str) {
    if enabled {
        args.push(flag.into());
    }
}

fn push_value<V: Into<OsString>>(args: &mut Vec<OsString>, flag: &str, value: Option<V>) {
    if let Some(value) = value {
        args.push(flag.into());
        args.push(value.into());
    }
}

impl MigrationOptions {
    /// Whether the checkpointed container keeps running afterwards.
    pub fn keeps_running(&self, extras: &CheckpointExtras) -> bool {
        self.leave_running || extras.pre_dump
    }

    fn common_args(&self, args: &mut Vec<OsString>) {
        args.push("--image-path".into());
        args.push(self.image_path.clone().into());
        push_value(args, "--work-path", self.work_path.clone());
        push_flag(args, self.tcp_established, "--tcp-established");
        push_flag(args, self.ext_unix_sk, "--ext-unix-sk");
        push_flag(args, self.shell_job, "--shell-job");
        push_flag(args, self.lazy_pages, "--lazy-pages");
        push_flag(args, self.file_locks, "--file-locks");
        push_value(args, "--manage-cgroups-mode", self.cgroups_mode.map(|m| m.to_string()));
        for ns in &self.empty_ns {
            args.push("--empty-ns".into());
            args.push(ns.into());
        }
        push_flag(args, self.auto_dedup, "--auto-dedup");
        push_flag(args, self.track_mem, "--track-mem");
    }

    /// Runtime flags for `checkpoint`, without the container id.
    pub fn checkpoint_args(&self, extras: &CheckpointExtras) -> Vec<OsString> {
        let mut args = Vec::new();
        self.common_args(&mut args);
        push_value(&mut args, "--parent-path", self.parent_path.clone());
        push_flag(&mut args, self.leave_running, "--leave-running");
        push_value(&mut args, "--status-fd", extras.status_fd.map(|fd| fd.to_string()));
        push_value(&mut args, "--page-server", extras.page_server.clone());
        push_flag(&mut args, extras.pre_dump, "--pre-dump");
        args
    }

    /// Runtime flags for `restore`, without the container id.
    pub fn restore_args(&self, extras: &RestoreExtras) -> Vec<OsString> {
        let mut args = Vec::new();
        self.common_args(&mut args);
        args.push("--bundle".into());
        args.push(extras.bundle.clone().into());
        push_value(&mut args, "--console-socket", extras.console_socket.clone());
        push_flag(&mut args, extras.detach, "--detach");
        push_value(&mut args, "--pid-file", extras.pid_file.clone());
        push_flag(&mut args, extras.no_subreaper, "--no-subreaper");
        push_flag(&mut args, extras.no_pivot, "--no-pivot");
        args
    }
}
