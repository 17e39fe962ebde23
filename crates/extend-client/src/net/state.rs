// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket lifecycle state.
//!
//! ```text
//!  +---------+  open()   +------+  close()  +--------+
//!  | Initial |---------->| Open |---------->| Closed |
//!  +---------+           +------+           +--------+
//! ```
//!
//! `Closed` is terminal. `close()` on an `Initial` socket also lands in `Closed`.

use crate::error::{Error, Result};

/// Lifecycle state shared by [`TcpSocket`](super::TcpSocket),
/// [`UdpSocket`](super::UdpSocket) and [`TcpSocketAccepter`](super::TcpSocketAccepter).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SocketState {
    /// Created, options may be configured, no platform socket yet.
    #[default]
    Initial,
    /// Platform socket exists and I/O is allowed.
    Open,
    /// Terminal.
    Closed,
}

impl SocketState {
    /// Fail unless the socket is open.
    pub fn ensure_open(self) -> Result<()> {
        match self {
            SocketState::Open => Ok(()),
            SocketState::Initial | SocketState::Closed => Err(Error::SocketClosed),
        }
    }

    /// Fail if the socket has been closed.
    pub fn ensure_not_closed(self) -> Result<()> {
        match self {
            SocketState::Closed => Err(Error::SocketClosed),
            _ => Ok(()),
        }
    }

    /// Fail unless the socket is still initial (immutable-once-open properties).
    pub fn ensure_initial(self, property: &str) -> Result<()> {
        match self {
            SocketState::Initial => Ok(()),
            other => Err(Error::InvalidState(format!(
                "{} cannot be changed once the socket is {}",
                property, other
            ))),
        }
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SocketState::Initial => "initial",
            SocketState::Open => "open",
            SocketState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards() {
        assert!(SocketState::Open.ensure_open().is_ok());
        assert!(matches!(
            SocketState::Initial.ensure_open(),
            Err(Error::SocketClosed)
        ));
        assert!(matches!(
            SocketState::Closed.ensure_not_closed(),
            Err(Error::SocketClosed)
        ));
        assert!(SocketState::Initial.ensure_initial("local address").is_ok());
        assert!(matches!(
            SocketState::Open.ensure_initial("local address"),
            Err(Error::InvalidState(_))
        ));
    }
}
