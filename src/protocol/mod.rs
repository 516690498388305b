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

//! Transfer wire protocol shared by the migration client and server.

pub mod framing;
pub mod messages;

use crate::errors::{MigrationError, MigrationResult};

pub use messages::{request::Kind, Request, Res, ResultCode};

/// Names travel as a single path component so the server never writes
/// outside of its image root.
pub fn validate_name(name: &str) -> MigrationResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(MigrationError::Remote {
            code: ResultCode::InvalidArgument,
            message: format!("invalid name {:?}", name),
        });
    }
    Ok(())
}
