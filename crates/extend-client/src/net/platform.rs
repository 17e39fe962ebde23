// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Platform stream socket seam.
//!
//! [`TcpSocket`](super::TcpSocket) never touches `socket2` directly; it asks a
//! [`SocketProvider`] for a [`PlatformSocket`]. The default provider creates
//! real `socket2` sockets; tests substitute providers that emulate OS
//! behavior such as clamped buffer sizes.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

/// Operations the socket wrapper needs from the OS socket.
pub trait PlatformSocket: Send + Sync {
    fn set_send_buffer_size(&self, size: usize) -> io::Result<()>;
    fn send_buffer_size(&self) -> io::Result<usize>;
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()>;
    fn recv_buffer_size(&self) -> io::Result<usize>;
    fn set_linger(&self, linger: Option<Duration>) -> io::Result<()>;
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
    fn set_keepalive(&self, keepalive: bool) -> io::Result<()>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn bind(&self, addr: SocketAddr) -> io::Result<()>;
    fn connect(&self, addr: SocketAddr, timeout: Option<Duration>) -> io::Result<()>;
    fn local_addr(&self) -> io::Result<Option<SocketAddr>>;
    fn peer_addr(&self) -> io::Result<Option<SocketAddr>>;
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn flush(&self) -> io::Result<()>;
    /// Shut down both directions, waking blocked readers.
    fn shutdown(&self) -> io::Result<()>;
}

/// Factory for platform stream sockets.
pub trait SocketProvider: Send + Sync {
    fn open_stream(&self, domain: Domain) -> io::Result<Box<dyn PlatformSocket>>;
}

/// Provider backed by real OS sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSocketProvider;

impl SocketProvider for SystemSocketProvider {
    fn open_stream(&self, domain: Domain) -> io::Result<Box<dyn PlatformSocket>> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        Ok(Box::new(socket))
    }
}

/// Domain matching an address family.
pub fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

impl PlatformSocket for Socket {
    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        Socket::set_send_buffer_size(self, size)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        Socket::send_buffer_size(self)
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        Socket::set_recv_buffer_size(self, size)
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        Socket::recv_buffer_size(self)
    }

    fn set_linger(&self, linger: Option<Duration>) -> io::Result<()> {
        Socket::set_linger(self, linger)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        Socket::set_nodelay(self, nodelay)
    }

    fn set_keepalive(&self, keepalive: bool) -> io::Result<()> {
        Socket::set_keepalive(self, keepalive)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Socket::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Socket::set_write_timeout(self, timeout)
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        Socket::bind(self, &SockAddr::from(addr))
    }

    fn connect(&self, addr: SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
        let addr = SockAddr::from(addr);
        match timeout {
            Some(timeout) => Socket::connect_timeout(self, &addr, timeout),
            None => Socket::connect(self, &addr),
        }
    }

    fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        Ok(Socket::local_addr(self)?.as_socket())
    }

    fn peer_addr(&self) -> io::Result<Option<SocketAddr>> {
        match Socket::peer_addr(self) {
            Ok(addr) => Ok(addr.as_socket()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream: &Socket = self;
        Read::read(&mut stream, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream: &Socket = self;
        Write::write(&mut stream, buf)
    }

    fn flush(&self) -> io::Result<()> {
        let mut stream: &Socket = self;
        Write::flush(&mut stream)
    }

    fn shutdown(&self) -> io::Result<()> {
        Socket::shutdown(self, Shutdown::Both)
    }
}
