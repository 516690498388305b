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

//! Frames are a 32-bit little endian payload length followed by the
//! protobuf encoding of one message.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use std::{
    io::{self, Read, Write},
    mem::size_of,
};

use crate::constants::MAX_FRAME_SIZE;
use crate::errors::{MigrationError, MigrationResult};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

const HEADER_LEN: usize = size_of::<u32>();

/// Reads exactly `len` bytes. `None` means the peer closed the stream
/// cleanly before sending anything.
pub fn read_bytes_next<S: Read>(src: &mut S, len: usize) -> MigrationResult<Option<BytesMut>> {
    let mut buf = Vec::with_capacity(len);
    src.take(len as u64).read_to_end(&mut buf)?;
    match buf.len() {
        0 if len > 0 => Ok(None),
        l if l == len => Ok(Some(buf[..].into())),
        l => Err(MigrationError::Protocol(format!(
            "EOF after {} of {} bytes", l, len
        ))),
    }
}

/// Reads the next message, or `None` if the peer closed the channel
/// between frames.
pub fn pb_read_next<S: Read, T: Message + Default>(src: &mut S) -> MigrationResult<Option<(T, usize)>> {
    let mut size_buf = match read_bytes_next(src, HEADER_LEN)? {
        None => return Ok(None),
        Some(size_buf) => size_buf,
    };

    let size = size_buf.get_u32_le() as usize;
    if size > MAX_FRAME_SIZE {
        return Err(MigrationError::FrameTooLarge(size));
    }

    let buf = match size {
        0 => BytesMut::new(),
        _ => read_bytes_next(src, size)?.ok_or(MigrationError::ChannelClosed)?,
    };
    Ok(Some((T::decode(buf)?, HEADER_LEN + size)))
}

/// Like [`pb_read_next`], but a closed channel is an error.
pub fn pb_read<S: Read, T: Message + Default>(src: &mut S) -> MigrationResult<T> {
    pb_read_next(src)?
        .map(|(msg, _)| msg)
        .ok_or(MigrationError::ChannelClosed)
}

pub fn pb_write<S: Write, T: Message>(dst: &mut S, msg: &T) -> MigrationResult<usize> {
    let len = msg.encoded_len();
    if len > MAX_FRAME_SIZE {
        return Err(MigrationError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
    buf.put_u32_le(len as u32);
    msg.encode(&mut buf)?;
    dst.write_all(&buf)?;
    dst.flush()?;
    Ok(buf.len())
}

/// Socket timeouts surface as `WouldBlock` or `TimedOut` depending on the platform.
pub fn is_timeout(error: &MigrationError) -> bool {
    match error {
        MigrationError::Io(e) => matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
        _ => false,
    }
}
