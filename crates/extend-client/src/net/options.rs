// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket options and buffer-size negotiation.
//!
//! The OS is free to grant less buffer space than requested (Linux caps
//! `SO_SNDBUF`/`SO_RCVBUF` at `net.core.wmem_max`/`rmem_max`). After every
//! buffer request the negotiated size is read back:
//!
//! - `actual >= requested` -> accepted silently
//! - `actual < minimum` -> fatal ([`Error::BufferNegotiation`])
//! - `actual < 80% of requested` -> warning logged and recorded, continue

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Default floor for negotiated buffer sizes (16 KB).
pub const DEFAULT_MIN_BUFFER_SIZE: usize = 16 * 1024;

/// Drop rates are expressed per this many packets.
pub const DROP_RATE_SCALE: u32 = 100_000;

/// Options applied to a platform socket when it is opened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// SO_SNDBUF request (0 = OS default)
    pub send_buffer_size: usize,

    /// SO_RCVBUF request (0 = OS default)
    pub recv_buffer_size: usize,

    /// Negotiated sizes below this are fatal
    pub min_buffer_size: usize,

    /// SO_LINGER in milliseconds (None = disabled)
    pub linger_ms: Option<u64>,

    /// TCP_NODELAY
    pub nodelay: bool,

    /// SO_KEEPALIVE
    pub keepalive: bool,

    /// Read timeout in milliseconds (0 = block indefinitely)
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds (0 = block indefinitely)
    pub write_timeout_ms: u64,

    /// SO_REUSEADDR for bound sockets
    pub reuse_address: bool,

    /// Listen backlog for accepters
    pub backlog: u32,

    /// Outgoing packets dropped per 100 000 (debug builds only)
    pub tx_debug_drop_rate: u32,

    /// Incoming packets dropped per 100 000 (debug builds only)
    pub rx_debug_drop_rate: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_buffer_size: 0,
            recv_buffer_size: 0,
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            linger_ms: None,
            nodelay: true,
            keepalive: true,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            reuse_address: true,
            backlog: 128,
            tx_debug_drop_rate: 0,
            rx_debug_drop_rate: 0,
        }
    }
}

impl SocketOptions {
    /// Builder: request buffer sizes.
    pub fn with_buffers(mut self, send: usize, recv: usize) -> Self {
        self.send_buffer_size = send;
        self.recv_buffer_size = recv;
        self
    }

    /// Builder: set the negotiation floor.
    pub fn with_min_buffer_size(mut self, min: usize) -> Self {
        self.min_buffer_size = min;
        self
    }

    /// Builder: set the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Read timeout as an `Option` (None = blocking).
    pub fn read_timeout(&self) -> Option<Duration> {
        ms_to_timeout(self.read_timeout_ms)
    }

    /// Write timeout as an `Option` (None = blocking).
    pub fn write_timeout(&self) -> Option<Duration> {
        ms_to_timeout(self.write_timeout_ms)
    }

    /// Linger as a `Duration`.
    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    /// Validate option ranges.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.tx_debug_drop_rate > DROP_RATE_SCALE || self.rx_debug_drop_rate > DROP_RATE_SCALE {
            return Err("debug drop rates must be <= 100000");
        }
        if self.backlog == 0 {
            return Err("backlog must be > 0");
        }
        Ok(())
    }
}

fn ms_to_timeout(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

pub(crate) fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Which socket buffer is being negotiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Send,
    Receive,
}

impl BufferKind {
    pub fn label(self) -> &'static str {
        match self {
            BufferKind::Send => "send",
            BufferKind::Receive => "receive",
        }
    }
}

/// A buffer request the OS only partly honored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferWarning {
    pub kind: BufferKind,
    pub requested: usize,
    pub actual: usize,
}

impl BufferWarning {
    /// Granted size as a percentage of the request.
    pub fn percent(&self) -> usize {
        if self.requested == 0 {
            100
        } else {
            self.actual.saturating_mul(100) / self.requested
        }
    }
}

/// Request a buffer size and verify what the OS granted.
///
/// `apply` sets the option, `read_back` returns the negotiated size. A
/// request of 0 keeps the OS default and is not verified.
pub fn negotiate_buffer<A, R>(
    kind: BufferKind,
    requested: usize,
    minimum: usize,
    apply: A,
    read_back: R,
) -> Result<Option<BufferWarning>>
where
    A: FnOnce(usize) -> io::Result<()>,
    R: FnOnce() -> io::Result<usize>,
{
    if requested == 0 {
        return Ok(None);
    }

    apply(requested)?;
    let actual = read_back()?;
    if actual >= requested {
        return Ok(None);
    }

    if actual < minimum {
        return Err(Error::BufferNegotiation {
            kind: kind.label(),
            requested,
            actual,
            minimum,
        });
    }

    let warning = BufferWarning {
        kind,
        requested,
        actual,
    };
    // 80% threshold, integer form
    if actual.saturating_mul(5) < requested.saturating_mul(4) {
        log::warn!(
            "[SOCKET] failed to set {} buffer size to {} bytes; actual size is {}%, {} bytes. \
             Consult your OS documentation regarding increasing the maximum socket buffer size.",
            kind.label(),
            requested,
            warning.percent(),
            actual
        );
        return Ok(Some(warning));
    }

    log::debug!(
        "[SOCKET] {} buffer negotiated to {} of {} requested bytes",
        kind.label(),
        actual,
        requested
    );
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(actual: usize) -> impl FnOnce() -> io::Result<usize> {
        move || Ok(actual)
    }

    #[test]
    fn test_zero_request_keeps_os_default() {
        let out = negotiate_buffer(
            BufferKind::Send,
            0,
            1024,
            |_| panic!("must not apply"),
            || panic!("must not read"),
        )
        .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_full_grant_is_silent() {
        let out = negotiate_buffer(BufferKind::Send, 65536, 1024, |_| Ok(()), granted(131072));
        assert!(out.unwrap().is_none());
    }

    #[test]
    fn test_slight_shortfall_is_silent() {
        // 90% granted: above the 80% warning threshold
        let out = negotiate_buffer(BufferKind::Receive, 100_000, 1024, |_| Ok(()), granted(90_000));
        assert!(out.unwrap().is_none());
    }

    #[test]
    fn test_degraded_grant_warns() {
        let out = negotiate_buffer(BufferKind::Receive, 1 << 20, 16384, |_| Ok(()), granted(65536))
            .unwrap()
            .expect("warning expected");
        assert_eq!(out.kind, BufferKind::Receive);
        assert_eq!(out.actual, 65536);
        assert_eq!(out.percent(), 6);
    }

    #[test]
    fn test_below_minimum_is_fatal() {
        let err = negotiate_buffer(BufferKind::Send, 1 << 20, 16384, |_| Ok(()), granted(4096))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BufferNegotiation {
                kind: "send",
                actual: 4096,
                ..
            }
        ));
    }

    #[test]
    fn test_options_defaults_and_validation() {
        let opts = SocketOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.read_timeout(), None);

        let opts = SocketOptions {
            tx_debug_drop_rate: DROP_RATE_SCALE + 1,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
