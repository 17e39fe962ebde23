// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures for the integration tests.
//!
//! [`CountingBackend`] counts proxy-side requests by operation so tests can
//! assert how many network calls a client operation produced.
//! [`TrackingInitiator`] wraps in-process connections so tests can sever
//! them and observe how often resource channels are closed.

#![allow(dead_code)]

use extend_client::connection::{
    Channel, Connection, ConnectionInitiator, ConnectionListener, InProcessConnection, Receiver,
};
use extend_client::protocol::{ChannelUri, MessageFactory, Request, Value};
use extend_client::server::{HandlerReply, InMemoryBackend, ProxyBackend, SessionEffect, Target};
use extend_client::service::Subject;
use extend_client::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ============================================================================
// Backend
// ============================================================================

/// In-memory backend that counts requests and can slow resource creation.
pub struct CountingBackend {
    inner: InMemoryBackend,
    counts: Mutex<HashMap<&'static str, usize>>,
    create_delay: Mutex<Option<Duration>>,
}

impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryBackend::new(),
            counts: Mutex::new(HashMap::new()),
            create_delay: Mutex::new(None),
        })
    }

    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    /// Requests handled for `operation` (e.g. `"EnsureCache"`).
    pub fn count(&self, operation: &str) -> usize {
        self.counts.lock().get(operation).copied().unwrap_or(0)
    }

    /// Requests handled in total.
    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }

    /// Sleep this long inside every `EnsureCache`/`EnsureTopic`.
    pub fn delay_creation(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }
}

impl ProxyBackend for CountingBackend {
    fn handle(
        &self,
        target: &Target,
        request: Request,
        subject: Option<&str>,
    ) -> Result<(HandlerReply, Option<SessionEffect>)> {
        *self.counts.lock().entry(request.operation()).or_insert(0) += 1;
        if matches!(
            request,
            Request::EnsureCache { .. } | Request::EnsureTopic { .. }
        ) {
            let delay = *self.create_delay.lock();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
        }
        self.inner.handle(target, request, subject)
    }

    fn channel_closed(&self, target: &Target) {
        self.inner.channel_closed(target);
    }
}

// ============================================================================
// Connections
// ============================================================================

/// Initiator producing [`InProcessConnection`]s whose accepted channels
/// count their `close()` calls.
pub struct TrackingInitiator {
    backend: Arc<dyn ProxyBackend>,
    connects: AtomicUsize,
    refuse_connects: AtomicBool,
    fail_closes: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    last: Mutex<Option<Arc<InProcessConnection>>>,
}

impl TrackingInitiator {
    pub fn new(backend: Arc<dyn ProxyBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            connects: AtomicUsize::new(0),
            refuse_connects: AtomicBool::new(false),
            fail_closes: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
            last: Mutex::new(None),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// `close()` calls seen by accepted (resource) channels.
    pub fn channel_closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Fail every later `connect()` as if the proxy were gone.
    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Channels still open on the most recent connection.
    pub fn open_channels(&self) -> usize {
        self.last
            .lock()
            .as_ref()
            .map_or(0, |connection| connection.channel_count())
    }

    /// Make every accepted channel's `close()` fail after closing.
    pub fn fail_channel_closes(&self, fail: bool) {
        self.fail_closes.store(fail, Ordering::SeqCst);
    }

    /// Drop the current connection as if the proxy went away.
    pub fn sever(&self, error: Option<Error>) {
        let connection = self.last.lock().clone();
        if let Some(connection) = connection {
            connection.sever(error);
        }
    }
}

impl ConnectionInitiator for TrackingInitiator {
    fn connect(
        &self,
        _address: Option<SocketAddr>,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<Arc<dyn Connection>> {
        if self.refuse_connects.load(Ordering::SeqCst) {
            return Err(Error::Transport("proxy unreachable".into()));
        }
        let inner = Arc::new(InProcessConnection::new(
            Arc::clone(&self.backend),
            listener.clone(),
        ));
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(Arc::clone(&inner));
        if let Some(listener) = listener.upgrade() {
            listener.connection_opened(inner.id());
        }
        Ok(Arc::new(TrackedConnection {
            inner,
            fail_closes: Arc::clone(&self.fail_closes),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct TrackedConnection {
    inner: Arc<InProcessConnection>,
    fail_closes: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl Connection for TrackedConnection {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn open_channel(
        &self,
        protocol: extend_client::protocol::Protocol,
        name: &str,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>> {
        self.inner.open_channel(protocol, name, receiver, subject)
    }

    fn accept_channel(
        &self,
        uri: &ChannelUri,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>> {
        let inner = self.inner.accept_channel(uri, receiver, subject)?;
        Ok(Arc::new(TrackedChannel {
            inner,
            fail_closes: Arc::clone(&self.fail_closes),
            closes: Arc::clone(&self.closes),
        }))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

struct TrackedChannel {
    inner: Arc<dyn Channel>,
    fail_closes: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl Channel for TrackedChannel {
    fn id(&self) -> u32 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn message_factory(&self) -> MessageFactory {
        self.inner.message_factory()
    }

    fn request(&self, request: Request) -> Result<Value> {
        self.inner.request(request)
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()?;
        if self.fail_closes.load(Ordering::SeqCst) {
            return Err(Error::Transport("close refused".into()));
        }
        Ok(())
    }
}
