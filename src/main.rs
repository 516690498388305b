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

use std::{io, path::Path, process::exit, sync::Arc};

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use log::*;
use nix::unistd::geteuid;

use criu_migration::{
    cli::{ClientOpts, Endpoint, Mode, Opts, ServerOpts},
    client::{migrate, MigrationRequest, RestoreOutcome},
    config::Settings,
    errors::{MigrationError, MigrationResult},
    lifecycle::RestorePlan,
    logger::init_logger,
    runtime::RuncRuntime,
    server::{Server, ServerContext},
};

/// Loads settings and installs the logger; nothing is logged before this.
fn setup(endpoint: &Endpoint) -> Settings {
    let settings = match endpoint.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let level = settings.level_filter().unwrap_or(LevelFilter::Info);
    if let Err(e) = init_logger(Path::new(&settings.log_file), level) {
        eprintln!("{e}");
        exit(1);
    }
    settings
}

fn require_root(command: &str) -> MigrationResult<()> {
    if !geteuid().is_root() {
        return Err(MigrationError::InvalidState(format!("{command} requires root")));
    }
    Ok(())
}

fn run_client(opts: &ClientOpts, settings: &Settings) -> MigrationResult<()> {
    require_root("migration client")?;

    let runtime = RuncRuntime::new(&settings.runtime, settings.runtime_root.clone());
    let options = opts.options();
    let extras = opts.extras();
    let request = MigrationRequest {
        container_id: &opts.endpoint.container_id,
        address: &opts.endpoint.ip,
        port: opts.endpoint.port,
        options: &options,
        extras: &extras,
        timeouts: settings.timeouts(),
        chunk_size: settings.chunk_size,
    };

    let report = migrate(&runtime, &request)?;
    match report.restore {
        RestoreOutcome::Exited(status) => info!("Restored container exited with status {status}"),
        RestoreOutcome::ChannelClosed => info!("Restore accepted by the destination"),
        RestoreOutcome::StillRunning => info!("Restored container still running on the destination"),
    }
    Ok(())
}

fn run_server(opts: &ServerOpts, settings: &Settings) -> MigrationResult<i32> {
    require_root("migration server")?;

    let max_sessions = opts.max_sessions.unwrap_or(settings.max_sessions);
    if max_sessions == 0 {
        return Err(MigrationError::Config("max-sessions must be at least 1".to_string()));
    }

    let runtime = Arc::new(RuncRuntime::new(&settings.runtime, settings.runtime_root.clone()));
    let plan = RestorePlan::new(&opts.endpoint.container_id, opts.options(), opts.extras());
    let context = ServerContext::new(&opts.image_path, plan, runtime, settings.timeouts(), max_sessions);

    Server::bind(&opts.endpoint.ip, opts.endpoint.port, context)?.serve()
}

fn main() {
    let opts = Opts::parse();

    match opts.mode {
        Mode::Completions { shell } => {
            let shell: Shell = match shell.parse() {
                Ok(shell) => shell,
                Err(e) => {
                    eprintln!("Invalid shell type: {e}");
                    exit(1);
                }
            };
            let mut cmd = Opts::command();
            generate(shell, &mut cmd, "criu-migration", &mut io::stdout());
        }

        Mode::Client(client_opts) => {
            let settings = setup(&client_opts.endpoint);
            if let Err(e) = run_client(&client_opts, &settings) {
                error!("Migration failed: {e}");
                exit(1);
            }
        }

        Mode::Server(server_opts) => {
            let settings = setup(&server_opts.endpoint);
            match run_server(&server_opts, &settings) {
                // The restored container's exit status becomes ours.
                Ok(status) => exit(status),
                Err(e) => {
                    error!("Migration server failed: {e}");
                    exit(1);
                }
            }
        }
    };
}
