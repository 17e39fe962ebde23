// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection bound directly to a [`ProxyBackend`] in the same process.
//!
//! Requests run synchronously on the calling thread through a
//! [`ProxySession`], so every proxy-side behavior (channel binding, URI
//! acceptance, topic notifications) is exercised without sockets.

use super::{
    next_connection_id, report_loss, Channel, Connection, ConnectionInitiator, ConnectionListener,
    Receiver,
};
use crate::error::{Error, Result};
use crate::protocol::{ChannelUri, MessageFactory, Protocol, Request, Value};
use crate::server::{ProxyBackend, ProxySession};
use crate::service::Subject;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// In-process connection handle.
pub struct InProcessConnection {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    open: AtomicBool,
    session: ProxySession,
    channels: DashMap<u32, Arc<InProcessChannel>>,
    listener: Weak<dyn ConnectionListener>,
}

impl InProcessConnection {
    pub fn new(backend: Arc<dyn ProxyBackend>, listener: Weak<dyn ConnectionListener>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            Shared {
                id: next_connection_id(),
                open: AtomicBool::new(true),
                session: ProxySession::new(
                    backend,
                    Box::new(move |channel_id, message| {
                        if let Some(shared) = weak.upgrade() {
                            shared.deliver(channel_id, message);
                        }
                    }),
                ),
                channels: DashMap::new(),
                listener,
            }
        });
        Self { shared }
    }

    /// Drop the connection as if the proxy went away.
    ///
    /// With `error` the listener sees `connection_error`, otherwise
    /// `connection_closed`.
    pub fn sever(&self, error: Option<Error>) {
        if self.shared.shutdown() {
            report_loss(&self.shared.listener, self.shared.id, error.as_ref());
        }
    }

    /// Channels currently open on this connection.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    fn register(
        &self,
        id: u32,
        protocol: Protocol,
        receiver: Option<Arc<dyn Receiver>>,
    ) -> Arc<dyn Channel> {
        let channel = Arc::new(InProcessChannel {
            id,
            factory: MessageFactory::new(protocol),
            open: AtomicBool::new(true),
            receiver,
            connection: Arc::downgrade(&self.shared),
        });
        self.shared.channels.insert(id, Arc::clone(&channel));
        channel
    }
}

impl Shared {
    fn deliver(&self, channel_id: u32, message: Value) {
        let receiver = self
            .channels
            .get(&channel_id)
            .and_then(|c| c.receiver.clone());
        if let Some(receiver) = receiver {
            receiver.on_message(channel_id, message);
        }
    }

    /// Mark closed and close every channel. Returns false if already closed.
    fn shutdown(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let channels: Vec<Arc<InProcessChannel>> =
            self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        self.channels.clear();
        for channel in channels {
            if channel.open.swap(false, Ordering::AcqRel) {
                if let Some(receiver) = &channel.receiver {
                    receiver.on_channel_closed(channel.id);
                }
            }
        }
        self.session.close_all();
        true
    }
}

impl Connection for InProcessConnection {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn open_channel(
        &self,
        protocol: Protocol,
        name: &str,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let id = self
            .shared
            .session
            .open_channel(protocol, subject.map(|s| s.principal().to_string()))?;
        log::debug!(
            "[LOCAL] connection {} opened {} channel {} for '{}'",
            self.shared.id,
            protocol,
            id,
            name
        );
        Ok(self.register(id, protocol, receiver))
    }

    fn accept_channel(
        &self,
        uri: &ChannelUri,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let id = self
            .shared
            .session
            .accept_channel(uri, subject.map(|s| s.principal().to_string()))?;
        Ok(self.register(id, uri.protocol, receiver))
    }

    fn close(&self) -> Result<()> {
        if self.shared.shutdown() {
            log::debug!("[LOCAL] connection {} closed", self.shared.id);
        }
        Ok(())
    }
}

struct InProcessChannel {
    id: u32,
    factory: MessageFactory,
    open: AtomicBool,
    receiver: Option<Arc<dyn Receiver>>,
    connection: Weak<Shared>,
}

impl Channel for InProcessChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn message_factory(&self) -> MessageFactory {
        self.factory
    }

    fn request(&self, request: Request) -> Result<Value> {
        let shared = self.connection.upgrade().ok_or(Error::ConnectionClosed)?;
        if !shared.open.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        if !self.is_open() {
            return Err(Error::InvalidState(format!("channel {} is closed", self.id)));
        }
        if !self.factory.accepts(&request) {
            return Err(Error::protocol(format!(
                "{} request on {} channel",
                request.protocol(),
                self.factory.protocol()
            )));
        }
        shared.session.handle(self.id, request).into_result()
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            if let Some(shared) = self.connection.upgrade() {
                shared.channels.remove(&self.id);
                shared.session.close_channel(self.id);
            }
        }
        Ok(())
    }
}

/// Initiator producing [`InProcessConnection`]s against one backend.
pub struct InProcessInitiator {
    backend: Arc<dyn ProxyBackend>,
    connects: AtomicUsize,
    last: parking_lot::Mutex<Weak<InProcessConnection>>,
}

impl InProcessInitiator {
    pub fn new(backend: Arc<dyn ProxyBackend>) -> Self {
        Self {
            backend,
            connects: AtomicUsize::new(0),
            last: parking_lot::Mutex::new(Weak::new()),
        }
    }

    /// Connections established so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    /// The most recent connection, if still alive.
    pub fn last_connection(&self) -> Option<Arc<InProcessConnection>> {
        self.last.lock().upgrade()
    }
}

impl ConnectionInitiator for InProcessInitiator {
    fn connect(
        &self,
        _address: Option<SocketAddr>,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<Arc<dyn Connection>> {
        let connection = Arc::new(InProcessConnection::new(
            Arc::clone(&self.backend),
            listener.clone(),
        ));
        self.connects.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Arc::downgrade(&connection);
        if let Some(listener) = listener.upgrade() {
            listener.connection_opened(connection.id());
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::detached_listener;
    use crate::server::InMemoryBackend;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        closed: Mutex<Vec<u64>>,
        errors: Mutex<Vec<u64>>,
    }

    impl ConnectionListener for Recorder {
        fn connection_opened(&self, _id: u64) {}

        fn connection_closed(&self, id: u64) {
            self.closed.lock().push(id);
        }

        fn connection_error(&self, id: u64, _error: &Error) {
            self.errors.lock().push(id);
        }
    }

    #[test]
    fn test_request_after_close_fails() {
        let conn = InProcessConnection::new(Arc::new(InMemoryBackend::new()), detached_listener());
        let channel = conn
            .open_channel(Protocol::CacheService, "svc", None, None)
            .unwrap();
        conn.close().unwrap();
        assert!(!channel.is_open());
        assert!(matches!(
            channel.request(Request::EnsureCache { name: "c".into() }),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_sever_reports_to_listener_once() {
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn ConnectionListener> = recorder.clone();
        let listener = Arc::downgrade(&as_listener);
        let conn = InProcessConnection::new(Arc::new(InMemoryBackend::new()), listener);
        conn.sever(Some(Error::transport("reset")));
        conn.sever(None);
        assert_eq!(*recorder.errors.lock(), vec![conn.id()]);
        assert!(recorder.closed.lock().is_empty());
    }

    #[test]
    fn test_channel_close_is_idempotent() {
        let conn = InProcessConnection::new(Arc::new(InMemoryBackend::new()), detached_listener());
        let channel = conn
            .open_channel(Protocol::NameService, "", None, None)
            .unwrap();
        assert_eq!(conn.channel_count(), 1);
        channel.close().unwrap();
        channel.close().unwrap();
        assert_eq!(conn.channel_count(), 0);
    }
}
