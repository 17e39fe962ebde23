// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram socket with bundle send and rebind-aware receive.
//!
//! A [`PacketBundle`] carries one payload for several destinations. Sending
//! attempts every destination and only then reports the last I/O error, so
//! one unreachable peer does not starve the others.
//!
//! Receive compares the socket handle taken before the blocking call with
//! the live one afterwards: a concurrent [`UdpSocket::rebind`] yields
//! [`Received::Rebound`] instead of an error, and a deliberate
//! [`UdpSocket::close`] yields [`Error::ConnectionClosed`].

use super::options::{negotiate_buffer, BufferKind, BufferWarning, SocketOptions};
#[cfg(debug_assertions)]
use super::options::DROP_RATE_SCALE;
use super::platform::domain_for;
use super::state::SocketState;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use socket2::{Protocol, SockAddr, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One payload addressed to one or more destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBundle {
    destinations: Vec<SocketAddr>,
    payload: Vec<u8>,
}

impl PacketBundle {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            destinations: Vec::new(),
            payload,
        }
    }

    pub fn to(mut self, destination: SocketAddr) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn add_destination(&mut self, destination: SocketAddr) {
        self.destinations.push(destination);
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Outcome of a single receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// `len` bytes from `from` were written to the buffer.
    Packet { len: usize, from: SocketAddr },
    /// The read timeout expired.
    TimedOut,
    /// The socket was rebound while this receive was in flight.
    Rebound,
    /// The packet was discarded by debug drop injection.
    Dropped,
}

/// Datagram socket wrapper.
pub struct UdpSocket {
    inner: Mutex<Inner>,
    tx_dropped: AtomicU64,
    rx_dropped: AtomicU64,
}

struct Inner {
    state: SocketState,
    bind_address: SocketAddr,
    options: SocketOptions,
    socket: Option<Arc<std::net::UdpSocket>>,
    warnings: Vec<BufferWarning>,
}

impl UdpSocket {
    pub fn new(bind_address: SocketAddr, options: SocketOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SocketState::Initial,
                bind_address,
                options,
                socket: None,
                warnings: Vec::new(),
            }),
            tx_dropped: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    /// Bind the platform socket and apply options.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SocketState::Open => return Ok(()),
            SocketState::Closed => return Err(Error::SocketClosed),
            SocketState::Initial => {}
        }

        match bind(inner.bind_address, &inner.options) {
            Ok((socket, warnings)) => {
                if let Ok(addr) = socket.local_addr() {
                    inner.bind_address = addr;
                }
                log::debug!("[UDP] socket bound to {}", inner.bind_address);
                inner.socket = Some(Arc::new(socket));
                inner.warnings = warnings;
                inner.state = SocketState::Open;
                Ok(())
            }
            Err(e) => {
                inner.state = SocketState::Closed;
                Err(e)
            }
        }
    }

    /// Replace the platform socket with one bound to `addr`.
    ///
    /// A receive blocked on the old socket wakes up and reports
    /// [`Received::Rebound`].
    pub fn rebind(&self, addr: SocketAddr) -> Result<()> {
        let old = {
            let mut inner = self.inner.lock();
            inner.state.ensure_open()?;
            let (socket, warnings) = bind(addr, &inner.options)?;
            inner.bind_address = socket.local_addr().unwrap_or(addr);
            inner.warnings = warnings;
            log::debug!("[UDP] socket rebound to {}", inner.bind_address);
            inner.socket.replace(Arc::new(socket))
        };
        if let Some(old) = old {
            wake(&old);
        }
        Ok(())
    }

    /// Close the socket. Idempotent; close errors are swallowed.
    pub fn close(&self) {
        let socket = {
            let mut inner = self.inner.lock();
            if inner.state == SocketState::Closed {
                return;
            }
            inner.state = SocketState::Closed;
            inner.socket.take()
        };
        if let Some(socket) = socket {
            wake(&socket);
        }
    }

    /// Send a bundle to every destination.
    ///
    /// All destinations are attempted; if any failed the last error is
    /// returned after the loop.
    pub fn send(&self, bundle: &PacketBundle) -> Result<()> {
        let (socket, drop_rate) = {
            let inner = self.inner.lock();
            inner.state.ensure_open()?;
            let socket = inner.socket.clone().ok_or(Error::SocketClosed)?;
            (socket, inner.options.tx_debug_drop_rate)
        };

        let mut last_error: Option<io::Error> = None;
        for destination in bundle.destinations() {
            if debug_drop(drop_rate) {
                self.tx_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Err(e) = socket.send_to(bundle.payload(), destination) {
                if let Some(previous) = &last_error {
                    log::debug!("[UDP] superseded send error: {}", previous);
                }
                log::debug!("[UDP] send to {} failed: {}", destination, e);
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(Error::Io(e)),
            None => Ok(()),
        }
    }

    /// Send one payload to one destination.
    pub fn send_to(&self, payload: &[u8], destination: SocketAddr) -> Result<()> {
        self.send(&PacketBundle::new(payload.to_vec()).to(destination))
    }

    /// Receive one datagram into `buf`.
    pub fn receive(&self, buf: &mut [u8]) -> Result<Received> {
        let (socket, drop_rate) = {
            let inner = self.inner.lock();
            match inner.state {
                SocketState::Open => {}
                SocketState::Closed => return Err(Error::ConnectionClosed),
                SocketState::Initial => return Err(Error::SocketClosed),
            }
            let socket = inner.socket.clone().ok_or(Error::SocketClosed)?;
            (socket, inner.options.rx_debug_drop_rate)
        };

        let result = socket.recv_from(buf);

        let swapped = {
            let inner = self.inner.lock();
            if inner.state == SocketState::Closed {
                return Err(Error::ConnectionClosed);
            }
            !matches!(&inner.socket, Some(live) if Arc::ptr_eq(live, &socket))
        };

        match result {
            Ok((0, _)) if swapped => Ok(Received::Rebound),
            Ok((len, from)) => {
                if debug_drop(drop_rate) {
                    self.rx_dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(Received::Dropped);
                }
                Ok(Received::Packet { len, from })
            }
            Err(_) if swapped => Ok(Received::Rebound),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(Received::TimedOut)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_not_closed()?;
        inner.options.read_timeout_ms = timeout.map(super::options::duration_to_ms).unwrap_or(0);
        if let Some(socket) = &inner.socket {
            socket.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    /// Join an IPv4 multicast group on the default interface.
    pub fn join_multicast(&self, group: Ipv4Addr) -> Result<()> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        let socket = inner.socket.as_ref().ok_or(Error::SocketClosed)?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(())
    }

    pub fn local_address(&self) -> SocketAddr {
        self.inner.lock().bind_address
    }

    pub fn buffer_warnings(&self) -> Vec<BufferWarning> {
        self.inner.lock().warnings.clone()
    }

    /// Packets discarded by debug drop injection (tx, rx).
    pub fn dropped(&self) -> (u64, u64) {
        (
            self.tx_dropped.load(Ordering::Relaxed),
            self.rx_dropped.load(Ordering::Relaxed),
        )
    }
}

fn bind(
    addr: SocketAddr,
    options: &SocketOptions,
) -> Result<(std::net::UdpSocket, Vec<BufferWarning>)> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    let configured = configure(&socket, addr, options);
    match configured {
        Ok(warnings) => Ok((socket.into(), warnings)),
        // socket dropped (closed) here
        Err(e) => Err(e),
    }
}

fn configure(
    socket: &Socket,
    addr: SocketAddr,
    options: &SocketOptions,
) -> Result<Vec<BufferWarning>> {
    socket.set_reuse_address(options.reuse_address)?;

    let mut warnings = Vec::new();
    if let Some(w) = negotiate_buffer(
        BufferKind::Send,
        options.send_buffer_size,
        options.min_buffer_size,
        |n| socket.set_send_buffer_size(n),
        || socket.send_buffer_size(),
    )? {
        warnings.push(w);
    }
    if let Some(w) = negotiate_buffer(
        BufferKind::Receive,
        options.recv_buffer_size,
        options.min_buffer_size,
        |n| socket.set_recv_buffer_size(n),
        || socket.recv_buffer_size(),
    )? {
        warnings.push(w);
    }

    socket.bind(&SockAddr::from(addr))?;
    socket.set_read_timeout(options.read_timeout())?;
    Ok(warnings)
}

/// Wake a receiver blocked on `socket`.
fn wake(socket: &std::net::UdpSocket) {
    // Linux reports ENOTCONN for unconnected datagram sockets but still
    // wakes blocked readers.
    if let Err(e) = SockRef::from(socket).shutdown(Shutdown::Read) {
        log::trace!("[UDP] shutdown on close: {}", e);
    }
}

#[cfg(debug_assertions)]
fn debug_drop(rate: u32) -> bool {
    rate > 0 && fastrand::u32(0..DROP_RATE_SCALE) < rate
}

#[cfg(not(debug_assertions))]
fn debug_drop(_rate: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_send_receive_roundtrip() {
        let rx = UdpSocket::new(loopback(), SocketOptions::default());
        rx.open().unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let tx = UdpSocket::new(loopback(), SocketOptions::default());
        tx.open().unwrap();

        tx.send_to(b"hello", rx.local_address()).unwrap();

        let mut buf = [0u8; 64];
        match rx.receive(&mut buf).unwrap() {
            Received::Packet { len, from } => {
                assert_eq!(&buf[..len], b"hello");
                assert_eq!(from, tx.local_address());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_receive_after_close_is_connection_closed() {
        let socket = UdpSocket::new(loopback(), SocketOptions::default());
        socket.open().unwrap();
        socket.close();
        let mut buf = [0u8; 8];
        assert!(matches!(
            socket.receive(&mut buf),
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(
            socket.send_to(b"x", "127.0.0.1:9".parse().unwrap()),
            Err(Error::SocketClosed)
        ));
    }

    #[test]
    fn test_timeout_reported() {
        let socket = UdpSocket::new(loopback(), SocketOptions::default());
        socket.open().unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(socket.receive(&mut buf).unwrap(), Received::TimedOut);
    }

    #[test]
    fn test_rebind_during_receive() {
        let socket = Arc::new(UdpSocket::new(loopback(), SocketOptions::default()));
        socket.open().unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let receiver = {
            let socket = Arc::clone(&socket);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                socket.receive(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(30));
        socket.rebind(loopback()).unwrap();

        assert_eq!(receiver.join().unwrap().unwrap(), Received::Rebound);
        assert_eq!(socket.state(), SocketState::Open);
    }

    #[test]
    fn test_close_during_receive() {
        let socket = Arc::new(UdpSocket::new(loopback(), SocketOptions::default()));
        socket.open().unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let receiver = {
            let socket = Arc::clone(&socket);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                socket.receive(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(30));
        socket.close();

        assert!(matches!(
            receiver.join().unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_full_tx_drop_rate_drops_everything() {
        let rx = UdpSocket::new(loopback(), SocketOptions::default());
        rx.open().unwrap();
        let options = SocketOptions {
            tx_debug_drop_rate: DROP_RATE_SCALE,
            ..Default::default()
        };
        let tx = UdpSocket::new(loopback(), options);
        tx.open().unwrap();

        let bundle = PacketBundle::new(b"x".to_vec())
            .to(rx.local_address())
            .to(rx.local_address());
        tx.send(&bundle).unwrap();
        assert_eq!(tx.dropped(), (2, 0));
    }
}
