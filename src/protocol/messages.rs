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

//! Protobuf schema of the file transfer service.
//!
//! Every client frame is a [`Request`] tagged with the session it belongs
//! to; every server frame is a [`Res`].

/// Opens a migration session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    #[prost(string, tag = "2")]
    pub container_id: ::prost::alloc::string::String,
}

/// Names the image directory created under the server's image root.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FolderInfo {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
}

/// Announces the file whose data follows.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub mode: u32,
    #[prost(uint64, tag = "3")]
    pub size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileData {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// Completes the data stream of the announced file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileDataEnd {
    #[prost(uint64, tag = "1")]
    pub total_size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerInfo {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(uint32, tag = "1")]
    pub session_id: u32,
    #[prost(oneof = "request::Kind", tags = "2, 3, 4, 5, 6, 7")]
    pub kind: ::core::option::Option<request::Kind>,
}

/// Nested message types in `Request`.
pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        Hello(super::Hello),
        #[prost(message, tag = "3")]
        Folder(super::FolderInfo),
        #[prost(message, tag = "4")]
        File(super::FileInfo),
        #[prost(message, tag = "5")]
        Data(super::FileData),
        #[prost(message, tag = "6")]
        DataEnd(super::FileDataEnd),
        #[prost(message, tag = "7")]
        Restore(super::ContainerInfo),
    }

    impl Kind {
        pub fn name(&self) -> &'static str {
            match self {
                Kind::Hello(_) => "Hello",
                Kind::Folder(_) => "FolderInfo",
                Kind::File(_) => "FileInfo",
                Kind::Data(_) => "FileData",
                Kind::DataEnd(_) => "FileDataEnd",
                Kind::Restore(_) => "ContainerInfo",
            }
        }
    }
}

/// Reply to every request. `message` is informational; callers branch on `code`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Res {
    #[prost(enumeration = "ResultCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub session_id: u32,
    #[prost(int32, optional, tag = "4")]
    pub exit_status: ::core::option::Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    Accepted = 1,
    Restored = 2,
    OutOfOrder = 3,
    InvalidArgument = 4,
    AlreadyExists = 5,
    Busy = 6,
    SessionMismatch = 7,
    Io = 8,
    SizeMismatch = 9,
    RestoreFailed = 10,
    Protocol = 11,
}

impl ResultCode {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::Accepted => "ACCEPTED",
            ResultCode::Restored => "RESTORED",
            ResultCode::OutOfOrder => "OUT_OF_ORDER",
            ResultCode::InvalidArgument => "INVALID_ARGUMENT",
            ResultCode::AlreadyExists => "ALREADY_EXISTS",
            ResultCode::Busy => "BUSY",
            ResultCode::SessionMismatch => "SESSION_MISMATCH",
            ResultCode::Io => "IO",
            ResultCode::SizeMismatch => "SIZE_MISMATCH",
            ResultCode::RestoreFailed => "RESTORE_FAILED",
            ResultCode::Protocol => "PROTOCOL",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Ok | ResultCode::Accepted | ResultCode::Restored)
    }
}

impl Request {
    pub fn new(session_id: u32, kind: request::Kind) -> Self {
        Self { session_id, kind: Some(kind) }
    }
}

impl Res {
    pub fn new(code: ResultCode, message: impl Into<String>, session_id: u32) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            session_id,
            exit_status: None,
        }
    }

    pub fn restored(exit_status: i32, message: impl Into<String>, session_id: u32) -> Self {
        Self {
            exit_status: Some(exit_status),
            ..Self::new(ResultCode::Restored, message, session_id)
        }
    }

    /// Unknown codes from a newer peer are treated as protocol failures.
    pub fn result_code(&self) -> ResultCode {
        ResultCode::from_i32(self.code).unwrap_or(ResultCode::Protocol)
    }
}
