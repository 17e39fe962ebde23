// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket abstraction: lifecycle-managed TCP/UDP sockets and a TCP accepter.
//!
//! Every socket follows the same INITIAL -> OPEN -> CLOSED state machine
//! guarded by one per-instance lock. Buffer sizes are negotiated with the OS
//! and verified on open (see [`negotiate_buffer`]).

mod accepter;
mod options;
mod platform;
mod state;
mod tcp;
mod udp;

pub use accepter::TcpSocketAccepter;
pub use options::{
    negotiate_buffer, BufferKind, BufferWarning, SocketOptions, DEFAULT_MIN_BUFFER_SIZE,
    DROP_RATE_SCALE,
};
pub(crate) use options::duration_to_ms;
pub use platform::{domain_for, PlatformSocket, SocketProvider, SystemSocketProvider};
pub use state::SocketState;
pub use tcp::{SocketStream, TcpSocket};
pub use udp::{PacketBundle, Received, UdpSocket};
