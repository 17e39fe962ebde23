// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listening socket producing open [`TcpSocket`]s.

use super::options::{negotiate_buffer, BufferKind, BufferWarning, SocketOptions};
use super::platform::domain_for;
use super::state::SocketState;
use super::tcp::TcpSocket;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use socket2::{Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// TCP listener with the INITIAL/OPEN/CLOSED lifecycle.
///
/// The receive buffer is negotiated on the listening socket so accepted
/// connections inherit it. Accepted sockets get the full option set applied
/// and are returned already `Open`.
pub struct TcpSocketAccepter {
    inner: Mutex<Inner>,
}

struct Inner {
    state: SocketState,
    bind_address: SocketAddr,
    options: SocketOptions,
    accept_timeout: Option<Duration>,
    listener: Option<Arc<Socket>>,
    warnings: Vec<BufferWarning>,
}

impl TcpSocketAccepter {
    pub fn new(bind_address: SocketAddr, options: SocketOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SocketState::Initial,
                bind_address,
                options,
                accept_timeout: None,
                listener: None,
                warnings: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    /// Bounded accept: `accept()` returns `Ok(None)` when it expires.
    pub fn set_accept_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_not_closed()?;
        inner.accept_timeout = timeout;
        if let Some(listener) = &inner.listener {
            listener.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    /// Bind and listen.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SocketState::Open => return Ok(()),
            SocketState::Closed => return Err(Error::SocketClosed),
            SocketState::Initial => {}
        }

        let socket = Socket::new(
            domain_for(&inner.bind_address),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;

        match listen(&socket, &inner) {
            Ok(warnings) => {
                inner.warnings = warnings;
                if let Ok(addr) = socket.local_addr() {
                    if let Some(addr) = addr.as_socket() {
                        inner.bind_address = addr;
                    }
                }
                log::debug!("[TCP] accepter listening on {}", inner.bind_address);
                inner.listener = Some(Arc::new(socket));
                inner.state = SocketState::Open;
                Ok(())
            }
            Err(e) => {
                // dropping the socket closes it
                drop(socket);
                inner.state = SocketState::Closed;
                Err(e)
            }
        }
    }

    /// Accept one connection.
    ///
    /// Returns `Ok(None)` when the accept timeout expires,
    /// `Err(Error::SocketClosed)` once the accepter has been closed.
    pub fn accept(&self) -> Result<Option<TcpSocket>> {
        let (listener, options) = {
            let inner = self.inner.lock();
            inner.state.ensure_open()?;
            let listener = inner.listener.clone().ok_or(Error::SocketClosed)?;
            (listener, inner.options.clone())
        };

        match listener.accept() {
            Ok((socket, addr)) => {
                let remote = addr.as_socket().ok_or_else(|| {
                    Error::transport("accepted connection has no IP peer address")
                })?;
                socket.set_read_timeout(None)?;
                log::debug!("[TCP] accepted connection from {}", remote);
                TcpSocket::from_accepted(Box::new(socket), options, remote).map(Some)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                if self.state() == SocketState::Closed {
                    Err(Error::SocketClosed)
                } else {
                    Ok(None)
                }
            }
            Err(e) => {
                if self.state() == SocketState::Closed {
                    Err(Error::SocketClosed)
                } else {
                    Err(Error::Io(e))
                }
            }
        }
    }

    /// Stop listening. Idempotent.
    pub fn close(&self) {
        let listener = {
            let mut inner = self.inner.lock();
            if inner.state == SocketState::Closed {
                return;
            }
            inner.state = SocketState::Closed;
            inner.listener.take()
        };
        if let Some(listener) = listener {
            // wakes a thread blocked in accept() on Linux
            if let Err(e) = listener.shutdown(Shutdown::Both) {
                log::debug!("[TCP] accepter shutdown: {}", e);
            }
        }
    }

    /// Bound address (the OS-assigned port once open).
    pub fn local_address(&self) -> SocketAddr {
        self.inner.lock().bind_address
    }

    pub fn buffer_warnings(&self) -> Vec<BufferWarning> {
        self.inner.lock().warnings.clone()
    }
}

fn listen(socket: &Socket, inner: &Inner) -> Result<Vec<BufferWarning>> {
    let options = &inner.options;
    socket.set_reuse_address(options.reuse_address)?;

    let mut warnings = Vec::new();
    if let Some(w) = negotiate_buffer(
        BufferKind::Receive,
        options.recv_buffer_size,
        options.min_buffer_size,
        |n| socket.set_recv_buffer_size(n),
        || socket.recv_buffer_size(),
    )? {
        warnings.push(w);
    }

    socket.bind(&SockAddr::from(inner.bind_address))?;
    let backlog = i32::try_from(options.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    socket.set_read_timeout(inner.accept_timeout)?;
    Ok(warnings)
}
