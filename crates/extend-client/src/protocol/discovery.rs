// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram name-service lookup messages.
//!
//! ```text
//! request: "XTND" | u8 version | str cluster | str name
//! reply:   "XTND" | u8 status  | encoded Value
//! ```
//!
//! Strings are `u32 BE length | UTF-8`. A responder stays silent for lookups
//! addressed to another cluster.

use super::value::{put_str, Value, WireReader};
use crate::error::{Error, Result};

pub const DISCOVERY_MAGIC: &[u8; 4] = b"XTND";
pub const DISCOVERY_VERSION: u8 = 1;

/// Largest datagram either side sends.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub cluster: String,
    pub name: String,
}

impl LookupRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = DISCOVERY_MAGIC.to_vec();
        buf.push(DISCOVERY_VERSION);
        put_str(&mut buf, &self.cluster);
        put_str(&mut buf, &self.name);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = magic(data)?;
        let version = reader.u8()?;
        if version != DISCOVERY_VERSION {
            return Err(Error::protocol(format!(
                "unsupported discovery version {}",
                version
            )));
        }
        let request = Self {
            cluster: reader.string()?,
            name: reader.string()?,
        };
        reader.finish()?;
        Ok(request)
    }
}

/// Lookup reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Found,
    NotFound,
    Failed,
}

impl LookupStatus {
    fn to_u8(self) -> u8 {
        match self {
            LookupStatus::Found => 0,
            LookupStatus::NotFound => 1,
            LookupStatus::Failed => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(LookupStatus::Found),
            1 => Ok(LookupStatus::NotFound),
            2 => Ok(LookupStatus::Failed),
            other => Err(Error::protocol(format!("unknown lookup status {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupReply {
    pub status: LookupStatus,
    pub value: Value,
}

impl LookupReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = DISCOVERY_MAGIC.to_vec();
        buf.push(self.status.to_u8());
        self.value.encode_into(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = magic(data)?;
        let reply = Self {
            status: LookupStatus::from_u8(reader.u8()?)?,
            value: reader.value()?,
        };
        reader.finish()?;
        Ok(reply)
    }

    /// Found value, `Null` for a miss, a remote error for a failure.
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            LookupStatus::Found => Ok(self.value),
            LookupStatus::NotFound => Ok(Value::Null),
            LookupStatus::Failed => Err(Error::Remote {
                code: super::failure_code::INTERNAL,
                message: self
                    .value
                    .as_str()
                    .unwrap_or("name service lookup failed")
                    .to_string(),
            }),
        }
    }
}

fn magic(data: &[u8]) -> Result<WireReader<'_>> {
    match data.strip_prefix(DISCOVERY_MAGIC.as_slice()) {
        Some(rest) => Ok(WireReader::new(rest)),
        None => Err(Error::protocol("missing discovery magic")),
    }
}
