// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP stream socket with an explicit lifecycle.
//!
//! [`TcpSocket`] wraps a [`PlatformSocket`] behind the
//! [`SocketState`] machine. All state transitions and option mutations take
//! the per-socket lock; blocking calls (`connect`, stream reads and writes)
//! run outside it on a cloned platform handle so `close()` from another
//! thread is never stuck behind I/O.

use super::options::{negotiate_buffer, BufferKind, BufferWarning, SocketOptions};
use super::platform::{domain_for, PlatformSocket, SocketProvider, SystemSocketProvider};
use super::state::SocketState;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use socket2::Domain;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Stream socket (client side or accepted).
pub struct TcpSocket {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    provider: Arc<dyn SocketProvider>,
}

struct Inner {
    state: SocketState,
    options: SocketOptions,
    domain: Domain,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    platform: Option<Arc<dyn PlatformSocket>>,
    warnings: Vec<BufferWarning>,
}

impl TcpSocket {
    /// Create an IPv4 socket in the `Initial` state.
    pub fn new(options: SocketOptions) -> Self {
        Self::with_provider(options, Domain::IPV4, Arc::new(SystemSocketProvider))
    }

    /// Create a socket whose address family matches `remote`.
    pub fn for_remote(remote: &SocketAddr, options: SocketOptions) -> Self {
        Self::with_provider(options, domain_for(remote), Arc::new(SystemSocketProvider))
    }

    /// Create a socket that obtains its platform socket from `provider`.
    pub fn with_provider(
        options: SocketOptions,
        domain: Domain,
        provider: Arc<dyn SocketProvider>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SocketState::Initial,
                    options,
                    domain,
                    local_address: None,
                    remote_address: None,
                    platform: None,
                    warnings: Vec::new(),
                }),
                provider,
            }),
        }
    }

    /// Wrap an already connected platform socket (accepted by a listener).
    ///
    /// Options are applied with the same verification as [`open`](Self::open);
    /// on failure the platform socket is shut down.
    pub(crate) fn from_accepted(
        platform: Box<dyn PlatformSocket>,
        options: SocketOptions,
        remote: SocketAddr,
    ) -> Result<Self> {
        let platform: Arc<dyn PlatformSocket> = Arc::from(platform);
        let warnings = match configure(platform.as_ref(), &options, None) {
            Ok(warnings) => warnings,
            Err(e) => {
                let _ = platform.shutdown();
                return Err(e);
            }
        };
        let local_address = platform.local_addr().ok().flatten();

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SocketState::Open,
                    options,
                    domain: domain_for(&remote),
                    local_address,
                    remote_address: Some(remote),
                    platform: Some(platform),
                    warnings,
                }),
                provider: Arc::new(SystemSocketProvider),
            }),
        })
    }

    // ===== Lifecycle =====

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.shared.inner.lock().state
    }

    /// Create the platform socket and apply all configured options.
    ///
    /// Opening an open socket is a no-op; opening a closed one fails.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            SocketState::Open => return Ok(()),
            SocketState::Closed => return Err(Error::SocketClosed),
            SocketState::Initial => {}
        }

        let platform: Arc<dyn PlatformSocket> =
            match self.shared.provider.open_stream(inner.domain) {
                Ok(p) => Arc::from(p),
                Err(e) => {
                    inner.state = SocketState::Closed;
                    return Err(Error::Io(e));
                }
            };

        match configure(platform.as_ref(), &inner.options, inner.local_address) {
            Ok(warnings) => {
                inner.warnings = warnings;
                inner.platform = Some(platform);
                inner.state = SocketState::Open;
                log::debug!(
                    "[TCP] socket opened local={:?} options={:?}",
                    inner.local_address,
                    inner.options
                );
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = platform.shutdown() {
                    log::debug!("[TCP] close after failed open: {}", close_err);
                }
                inner.state = SocketState::Closed;
                Err(e)
            }
        }
    }

    /// Connect an open socket to `addr`.
    pub fn connect(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<()> {
        let platform = {
            let inner = self.shared.inner.lock();
            inner.state.ensure_open()?;
            if let Some(remote) = inner.remote_address {
                return Err(Error::InvalidState(format!(
                    "socket already connected to {}",
                    remote
                )));
            }
            inner.platform.clone().ok_or(Error::SocketClosed)?
        };

        platform.connect(addr, timeout).map_err(|e| {
            Error::Transport(format!("failed to connect to {}: {}", addr, e))
        })?;

        let mut inner = self.shared.inner.lock();
        inner.state.ensure_open()?;
        inner.remote_address = Some(addr);
        inner.local_address = platform.local_addr().ok().flatten();
        log::debug!("[TCP] connected {:?} -> {}", inner.local_address, addr);
        Ok(())
    }

    /// Close the socket. Idempotent; errors from the OS close are swallowed.
    pub fn close(&self) {
        let platform = {
            let mut inner = self.shared.inner.lock();
            if inner.state == SocketState::Closed {
                return;
            }
            inner.state = SocketState::Closed;
            inner.platform.take()
        };

        if let Some(platform) = platform {
            if let Err(e) = platform.shutdown() {
                log::debug!("[TCP] shutdown on close failed: {}", e);
            }
        }
    }

    // ===== Streams =====

    /// Readable half. Fails with "socket is closed" unless the socket is open.
    pub fn input_stream(&self) -> Result<SocketStream> {
        self.stream()
    }

    /// Writable half. Fails with "socket is closed" unless the socket is open.
    pub fn output_stream(&self) -> Result<SocketStream> {
        self.stream()
    }

    fn stream(&self) -> Result<SocketStream> {
        self.shared.inner.lock().state.ensure_open()?;
        Ok(SocketStream {
            shared: Arc::clone(&self.shared),
        })
    }

    // ===== Properties =====

    /// Bind address used by `open()`. Only settable while `Initial`.
    pub fn set_local_address(&self, addr: SocketAddr) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        inner.state.ensure_initial("local address")?;
        inner.domain = domain_for(&addr);
        inner.local_address = Some(addr);
        Ok(())
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().local_address
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().remote_address
    }

    /// Snapshot of the configured options.
    pub fn options(&self) -> SocketOptions {
        self.shared.inner.lock().options.clone()
    }

    /// Buffer requests the OS only partly honored.
    pub fn buffer_warnings(&self) -> Vec<BufferWarning> {
        self.shared.inner.lock().warnings.clone()
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.update(|options| options.send_buffer_size = size, |p, o, warnings| {
            if let Some(w) = negotiate_buffer(
                BufferKind::Send,
                o.send_buffer_size,
                o.min_buffer_size,
                |n| p.set_send_buffer_size(n),
                || p.send_buffer_size(),
            )? {
                warnings.push(w);
            }
            Ok(())
        })
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        self.update(|options| options.recv_buffer_size = size, |p, o, warnings| {
            if let Some(w) = negotiate_buffer(
                BufferKind::Receive,
                o.recv_buffer_size,
                o.min_buffer_size,
                |n| p.set_recv_buffer_size(n),
                || p.recv_buffer_size(),
            )? {
                warnings.push(w);
            }
            Ok(())
        })
    }

    pub fn set_linger(&self, linger: Option<Duration>) -> Result<()> {
        self.update(
            |options| options.linger_ms = linger.map(super::options::duration_to_ms),
            |p, o, _| Ok(p.set_linger(o.linger())?),
        )
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.update(
            |options| options.nodelay = nodelay,
            |p, o, _| Ok(p.set_nodelay(o.nodelay)?),
        )
    }

    pub fn set_keepalive(&self, keepalive: bool) -> Result<()> {
        self.update(
            |options| options.keepalive = keepalive,
            |p, o, _| Ok(p.set_keepalive(o.keepalive)?),
        )
    }

    /// Read timeout (None = block indefinitely).
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.update(
            |options| {
                options.read_timeout_ms = timeout.map(super::options::duration_to_ms).unwrap_or(0)
            },
            |p, o, _| Ok(p.set_read_timeout(o.read_timeout())?),
        )
    }

    /// Mutate an option while `Initial` or `Open`; when open, apply it live.
    /// The stored options change only if the live apply succeeds.
    fn update<M, A>(&self, mutate: M, apply: A) -> Result<()>
    where
        M: FnOnce(&mut SocketOptions),
        A: FnOnce(&dyn PlatformSocket, &SocketOptions, &mut Vec<BufferWarning>) -> Result<()>,
    {
        let mut inner = self.shared.inner.lock();
        inner.state.ensure_not_closed()?;
        let mut options = inner.options.clone();
        mutate(&mut options);

        if inner.state == SocketState::Open {
            if let Some(platform) = inner.platform.clone() {
                apply(platform.as_ref(), &options, &mut inner.warnings)?;
            }
        }
        inner.options = options;
        Ok(())
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("TcpSocket")
            .field("state", &inner.state)
            .field("local", &inner.local_address)
            .field("remote", &inner.remote_address)
            .finish()
    }
}

/// Apply options to a fresh platform socket, verifying buffer sizes.
fn configure(
    platform: &dyn PlatformSocket,
    options: &SocketOptions,
    bind: Option<SocketAddr>,
) -> Result<Vec<BufferWarning>> {
    let mut warnings = Vec::new();

    if let Some(w) = negotiate_buffer(
        BufferKind::Send,
        options.send_buffer_size,
        options.min_buffer_size,
        |n| platform.set_send_buffer_size(n),
        || platform.send_buffer_size(),
    )? {
        warnings.push(w);
    }
    if let Some(w) = negotiate_buffer(
        BufferKind::Receive,
        options.recv_buffer_size,
        options.min_buffer_size,
        |n| platform.set_recv_buffer_size(n),
        || platform.recv_buffer_size(),
    )? {
        warnings.push(w);
    }

    platform.set_linger(options.linger())?;
    platform.set_nodelay(options.nodelay)?;
    platform.set_keepalive(options.keepalive)?;
    platform.set_read_timeout(options.read_timeout())?;
    platform.set_write_timeout(options.write_timeout())?;

    if let Some(addr) = bind {
        platform.bind(addr)?;
    }
    Ok(warnings)
}

/// Read/write handle onto an open [`TcpSocket`].
///
/// Each call re-checks the socket state, so a stream obtained before
/// `close()` fails with "socket is closed" afterwards.
pub struct SocketStream {
    shared: Arc<Shared>,
}

impl SocketStream {
    fn platform(&self) -> io::Result<Arc<dyn PlatformSocket>> {
        let inner = self.shared.inner.lock();
        match (inner.state, &inner.platform) {
            (SocketState::Open, Some(platform)) => Ok(Arc::clone(platform)),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is closed",
            )),
        }
    }
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.platform()?.read(buf)
    }
}

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.platform()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.platform()?.flush()
    }
}
