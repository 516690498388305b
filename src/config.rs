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

use std::{path::{Path, PathBuf}, time::Duration};

use config::{Config, Environment, File, FileFormat};
use log::LevelFilter;
use serde::Deserialize;

use crate::constants::*;
use crate::errors::{MigrationError, MigrationResult};

/// Settings that are not part of the checkpoint/restore options.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// OCI runtime binary used for checkpoint and restore.
    pub runtime: String,
    pub runtime_root: Option<PathBuf>,
    pub rpc_timeout_secs: u64,
    /// Longest time a data stream may go without moving a chunk.
    pub progress_timeout_secs: u64,
    /// Unset waits for the restored container for as long as it runs.
    pub restore_timeout_secs: Option<u64>,
    pub chunk_size: usize,
    pub max_sessions: usize,
    pub log_file: String,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime: DEFAULT_RUNTIME.to_string(),
            runtime_root: None,
            rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            progress_timeout_secs: DEFAULT_PROGRESS_TIMEOUT_SECS,
            restore_timeout_secs: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_sessions: DEFAULT_MAX_SESSIONS,
            log_file: "-".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Layers the config file (if any) and `CRIU_MIGRATION_*` variables over
    /// the defaults. A missing default file is fine; a missing explicit one is not.
    pub fn load(config_file: Option<&Path>) -> MigrationResult<Self> {
        let (path, required) = match config_file {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(CONFIG_FILE), false),
        };

        if required && !path.exists() {
            return Err(MigrationError::Config(format!("{} not found", path.display())));
        }

        let settings: Settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json).required(required))
            .add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> MigrationResult<()> {
        if self.rpc_timeout_secs == 0 || self.progress_timeout_secs == 0 || self.restore_timeout_secs == Some(0) {
            return Err(MigrationError::Config("timeouts must be at least one second".to_string()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(MigrationError::Config(format!(
                "chunk_size must be between 1 and {}", MAX_CHUNK_SIZE
            )));
        }
        if self.max_sessions == 0 {
            return Err(MigrationError::Config("max_sessions must be at least 1".to_string()));
        }
        if self.runtime.is_empty() {
            return Err(MigrationError::Config("runtime must not be empty".to_string()));
        }
        self.level_filter()?;
        Ok(())
    }

    pub fn level_filter(&self) -> MigrationResult<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| MigrationError::Config(format!("invalid log_level {:?}", self.log_level)))
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            rpc: Duration::from_secs(self.rpc_timeout_secs),
            progress: Duration::from_secs(self.progress_timeout_secs),
            restore: self.restore_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Bounds applied to the transfer channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timeouts {
    /// Metadata calls and their replies.
    pub rpc: Duration,
    /// Liveness bound while streaming file data.
    pub progress: Duration,
    /// Waiting for the destination to report the restored container's exit.
    pub restore: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Settings::default().timeouts()
    }
}
