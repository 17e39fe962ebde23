// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for multiplexed channels over one TCP stream.
//!
//! ```text
//! +----------------+------+------------+------------+-----------+
//! | Length (4B BE) | kind | channel    | request id | body      |
//! |                | u8   | u32 BE     | u64 BE     | ...       |
//! +----------------+------+------------+------------+-----------+
//! ```
//!
//! The length covers everything after the length field. Channel 0 is the
//! control channel: `OpenChannel` and `AcceptChannel` travel on it and are
//! answered with a `Response` carrying the new channel id.

use super::message::Protocol;
use super::value::{put_opt_str, put_str, WireReader};
use crate::error::{Error, Result};
use std::io::{self, Read, Write};

/// Bytes after the length prefix that every frame carries.
pub const FRAME_HEADER_SIZE: usize = 1 + 4 + 8;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Control channel id.
pub const CONTROL_CHANNEL: u32 = 0;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    OpenChannel,
    AcceptChannel,
    CloseChannel,
    Request,
    Response,
    Notify,
}

impl FrameKind {
    fn to_u8(self) -> u8 {
        match self {
            FrameKind::OpenChannel => 1,
            FrameKind::AcceptChannel => 2,
            FrameKind::CloseChannel => 3,
            FrameKind::Request => 4,
            FrameKind::Response => 5,
            FrameKind::Notify => 6,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => FrameKind::OpenChannel,
            2 => FrameKind::AcceptChannel,
            3 => FrameKind::CloseChannel,
            4 => FrameKind::Request,
            5 => FrameKind::Response,
            6 => FrameKind::Notify,
            other => return Err(Error::protocol(format!("unknown frame kind {}", other))),
        })
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: u32,
    pub request: u64,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, channel: u32, request: u64, body: Vec<u8>) -> Self {
        Self {
            kind,
            channel,
            request,
            body,
        }
    }

    /// Encode including the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let len = FRAME_HEADER_SIZE + self.body.len();
        let mut buf = Vec::with_capacity(4 + len);
        buf.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_be_bytes());
        buf.push(self.kind.to_u8());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&self.request.to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())?;
        writer.flush()
    }

    /// Read one frame, blocking until complete.
    ///
    /// EOF before the length prefix maps to [`Error::ConnectionClosed`].
    pub fn read_from<R: Read>(reader: &mut R, max_size: usize) -> Result<Frame> {
        let mut len_buf = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_buf) {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
                _ => Error::Io(e),
            });
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len < FRAME_HEADER_SIZE {
            return Err(Error::protocol(format!(
                "frame length {} shorter than header ({})",
                len, FRAME_HEADER_SIZE
            )));
        }
        if len > max_size {
            return Err(Error::protocol(format!(
                "frame length {} exceeds maximum {}",
                len, max_size
            )));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let mut header = WireReader::new(&data[..FRAME_HEADER_SIZE]);
        let kind = FrameKind::from_u8(header.u8()?)?;
        let channel = header.u32()?;
        let request = header.u64()?;
        data.drain(..FRAME_HEADER_SIZE);

        Ok(Frame {
            kind,
            channel,
            request,
            body: data,
        })
    }
}

// ===== Control bodies =====

/// `OpenChannel` body: protocol, resource name, subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelBody {
    pub protocol: Protocol,
    pub name: String,
    pub subject: Option<String>,
}

impl OpenChannelBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.protocol.id()];
        put_str(&mut buf, &self.name);
        put_opt_str(&mut buf, self.subject.as_deref());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let body = Self {
            protocol: Protocol::from_id(reader.u8()?)?,
            name: reader.string()?,
            subject: reader.opt_string()?,
        };
        reader.finish()?;
        Ok(body)
    }
}

/// `AcceptChannel` body: channel URI, subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptChannelBody {
    pub uri: String,
    pub subject: Option<String>,
}

impl AcceptChannelBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str(&mut buf, &self.uri);
        put_opt_str(&mut buf, self.subject.as_deref());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let body = Self {
            uri: reader.string()?,
            subject: reader.opt_string()?,
        };
        reader.finish()?;
        Ok(body)
    }
}
