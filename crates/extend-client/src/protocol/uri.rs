// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel URIs returned by resource-creation requests.
//!
//! Form: `channel:<id>#<protocol>`, e.g. `channel:12#NamedCache`. The id is
//! the proxy-side channel the client binds to with `accept_channel`.

use super::message::Protocol;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

const SCHEME: &str = "channel:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelUri {
    pub id: u32,
    pub protocol: Protocol,
}

impl ChannelUri {
    pub fn new(id: u32, protocol: Protocol) -> Self {
        Self { id, protocol }
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}#{}", SCHEME, self.id, self.protocol)
    }
}

impl FromStr for ChannelUri {
    type Err = Error;

    /// Parse failures are transport errors.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::transport(format!("invalid channel URI '{}'", s));
        let rest = s.strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (id, protocol) = rest.split_once('#').ok_or_else(invalid)?;
        let id = id.parse::<u32>().map_err(|_| invalid())?;
        let protocol = Protocol::from_name(protocol).map_err(|_| invalid())?;
        Ok(Self { id, protocol })
    }
}
