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

use crate::protocol::framing::{KB, MB};

/// Version announced in `Hello`; both ends must agree.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default size of a file data chunk streamed to the server.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * KB;
/// Upper bound for a single chunk, enforced on both ends.
pub const MAX_CHUNK_SIZE: usize = MB;
/// Largest frame accepted from the wire: a full chunk plus message overhead.
pub const MAX_FRAME_SIZE: usize = MAX_CHUNK_SIZE + 4 * KB;

/// Mode of the image directory created on the destination.
pub const DEF_DIR_PERM: u32 = 0o755;
/// Only permission bits travel with a file; the file type is implied.
pub const MODE_PERM_MASK: u32 = 0o7777;

pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROGRESS_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_SESSIONS: usize = 1;
pub const DEFAULT_RUNTIME: &str = "runc";

/// CONFIG_FILE is used to load migration settings when `--config` is absent.
pub const CONFIG_FILE: &str = "criu-migration.json";
/// Environment variables with this prefix override the config file.
pub const ENV_PREFIX: &str = "CRIU_MIGRATION";

pub const MESSAGE_SUCCESS: &str = "success";
pub const MESSAGE_FILE_DONE: &str = "file read done";
pub const MESSAGE_RESTORE_ACCEPTED: &str = "restore accepted";
pub const MESSAGE_RESTORE_DONE: &str = "done restore container";
