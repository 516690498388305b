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

use std::path::PathBuf;

use clap::{Args, Parser};

use crate::config::Settings;
use crate::errors::MigrationResult;
use crate::options::{CgroupsMode, CheckpointExtras, MigrationOptions, RestoreExtras};

pub const DEFAULT_IMAGE_PATH: &str = "checkpoint";

#[derive(Parser)]
#[clap(
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION")
)]
pub struct Opts {
    #[clap(subcommand)]
    pub mode: Mode,
}

#[derive(Parser)]
pub enum Mode {
    #[clap(
        about = "Checkpoint a running container and transfer its images to a migration server",
        aliases = ["c", "migrationcli"]
    )]
    Client(ClientOpts),

    #[clap(
        about = "Receive checkpoint images and restore the container from them",
        aliases = ["s", "migrationsrv"]
    )]
    Server(ServerOpts),

    #[clap(about = "Generate shell completions")]
    Completions {
        #[clap(help = "Shell type (e.g., bash, zsh, fish, powershell, elvish)")]
        shell: String,
    },
}

/// Connection and ambient settings shared by both migration commands.
#[derive(Args)]
pub struct Endpoint {
    #[clap(help = "Name of the container instance")]
    pub container_id: String,

    #[clap(help = "Address of the migration server")]
    pub ip: String,

    #[clap(help = "Port of the migration server")]
    pub port: u16,

    #[clap(long, help = "Settings file (JSON); defaults to ./criu-migration.json if present")]
    pub config: Option<PathBuf>,

    #[clap(short = 'o', long, help = "Log file name, '-' for stdout")]
    pub log_file: Option<String>,

    #[clap(long, help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: Option<String>,
}

impl Endpoint {
    /// Loads the settings and applies the flags given on the command line.
    pub fn settings(&self) -> MigrationResult<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(log_file) = &self.log_file {
            settings.log_file = log_file.clone();
        }
        if let Some(log_level) = &self.log_level {
            settings.log_level = log_level.clone();
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Args)]
pub struct ClientOpts {
    #[clap(flatten)]
    pub endpoint: Endpoint,

    #[clap(long, default_value = DEFAULT_IMAGE_PATH, help = "Path for saving criu image files")]
    pub image_path: PathBuf,

    #[clap(long, help = "Path for saving work files and logs")]
    pub work_path: Option<PathBuf>,

    #[clap(long, help = "Path for previous criu image files in pre-dump")]
    pub parent_path: Option<PathBuf>,

    #[clap(long, help = "Leave the process running after checkpointing")]
    pub leave_running: bool,

    #[clap(long, help = "Allow open tcp connections")]
    pub tcp_established: bool,

    #[clap(long, help = "Allow external unix sockets")]
    pub ext_unix_sk: bool,

    #[clap(long, help = "Allow shell jobs")]
    pub shell_job: bool,

    #[clap(long, help = "Use userfaultfd to lazily restore memory pages")]
    pub lazy_pages: bool,

    #[clap(long, help = "CRIU writes \\0 to this FD once lazy-pages is ready")]
    pub status_fd: Option<i32>,

    #[clap(long, help = "ADDRESS:PORT of the page server")]
    pub page_server: Option<String>,

    #[clap(long, help = "Handle file locks, for safety")]
    pub file_locks: bool,

    #[clap(long, help = "Dump container's memory information only, leave the container running after this")]
    pub pre_dump: bool,

    #[clap(long, help = "Cgroups mode: 'soft' (default), 'full', 'strict' or 'ignore'")]
    pub manage_cgroups_mode: Option<CgroupsMode>,

    #[clap(long, help = "Create a namespace, but don't restore its properties")]
    pub empty_ns: Vec<String>,

    #[clap(long, help = "Enable auto deduplication of memory images")]
    pub auto_dedup: bool,

    #[clap(long, help = "Enable memory tracking for a later incremental dump")]
    pub track_mem: bool,
}

impl ClientOpts {
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            image_path: self.image_path.clone(),
            work_path: self.work_path.clone(),
            parent_path: self.parent_path.clone(),
            leave_running: self.leave_running,
            tcp_established: self.tcp_established,
            ext_unix_sk: self.ext_unix_sk,
            shell_job: self.shell_job,
            lazy_pages: self.lazy_pages,
            file_locks: self.file_locks,
            cgroups_mode: self.manage_cgroups_mode,
            empty_ns: self.empty_ns.clone(),
            auto_dedup: self.auto_dedup,
            track_mem: self.track_mem,
        }
    }

    pub fn extras(&self) -> CheckpointExtras {
        CheckpointExtras {
            status_fd: self.status_fd,
            page_server: self.page_server.clone(),
            pre_dump: self.pre_dump,
        }
    }
}

#[derive(Args)]
pub struct ServerOpts {
    #[clap(flatten)]
    pub endpoint: Endpoint,

    #[clap(long, help = "Path to an AF_UNIX socket which will receive a file descriptor referencing the master end of the console's pseudoterminal")]
    pub console_socket: Option<PathBuf>,

    #[clap(long, default_value = DEFAULT_IMAGE_PATH, help = "Directory under which received criu images are stored")]
    pub image_path: PathBuf,

    #[clap(long, help = "Path for saving work files and logs")]
    pub work_path: Option<PathBuf>,

    #[clap(long, help = "Allow open tcp connections")]
    pub tcp_established: bool,

    #[clap(long, help = "Allow external unix sockets")]
    pub ext_unix_sk: bool,

    #[clap(long, help = "Allow shell jobs")]
    pub shell_job: bool,

    #[clap(long, help = "Handle file locks, for safety")]
    pub file_locks: bool,

    #[clap(long, help = "Cgroups mode: 'soft' (default), 'full', 'strict' or 'ignore'")]
    pub manage_cgroups_mode: Option<CgroupsMode>,

    #[clap(short, long, default_value = ".", help = "Path to the root of the bundle directory")]
    pub bundle: PathBuf,

    #[clap(short, long, help = "Detach from the container's process")]
    pub detach: bool,

    #[clap(long, help = "Specify the file to write the process id to")]
    pub pid_file: Option<PathBuf>,

    #[clap(long, help = "Disable the use of the subreaper used to reap reparented processes")]
    pub no_subreaper: bool,

    #[clap(long, help = "Do not use pivot root to jail process inside rootfs")]
    pub no_pivot: bool,

    #[clap(long, help = "Create a namespace, but don't restore its properties")]
    pub empty_ns: Vec<String>,

    #[clap(long, help = "Enable auto deduplication of memory images")]
    pub auto_dedup: bool,

    #[clap(long, help = "Use userfaultfd to lazily restore memory pages")]
    pub lazy_pages: bool,

    #[clap(long, help = "Allow tracking memory of the restored process")]
    pub track_mem: bool,

    #[clap(long, help = "Number of migrations served at once")]
    pub max_sessions: Option<usize>,
}

impl ServerOpts {
    /// Restore options; the image path is replaced by the received directory.
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            image_path: self.image_path.clone(),
            work_path: self.work_path.clone(),
            parent_path: None,
            leave_running: false,
            tcp_established: self.tcp_established,
            ext_unix_sk: self.ext_unix_sk,
            shell_job: self.shell_job,
            lazy_pages: self.lazy_pages,
            file_locks: self.file_locks,
            cgroups_mode: self.manage_cgroups_mode,
            empty_ns: self.empty_ns.clone(),
            auto_dedup: self.auto_dedup,
            track_mem: self.track_mem,
        }
    }

    pub fn extras(&self) -> RestoreExtras {
        RestoreExtras {
            bundle: self.bundle.clone(),
            console_socket: self.console_socket.clone(),
            detach: self.detach,
            pid_file: self.pid_file.clone(),
            no_subreaper: self.no_subreaper,
            no_pivot: self.no_pivot,
        }
    }
}
