// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection and channel layer.
//!
//! A [`Connection`] is one physical link to a proxy. It multiplexes logical
//! [`Channel`]s, each bound to one message [`Protocol`]. Services open a
//! service-level channel with [`Connection::open_channel`]; resource proxies
//! bind to proxy-side channels they were handed a URI for with
//! [`Connection::accept_channel`].
//!
//! Transport-initiated closes and failures are reported to the
//! [`ConnectionListener`] given at connect time. A close requested through
//! [`Connection::close`] is not reported back.

mod inprocess;
mod initiator;
mod tcp;

pub use inprocess::{InProcessConnection, InProcessInitiator};
pub use initiator::TcpInitiator;
pub use tcp::TcpConnection;

use crate::error::Result;
use crate::protocol::{ChannelUri, MessageFactory, Protocol, Request, Value};
use crate::service::Subject;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handler for unsolicited messages pushed on a channel.
///
/// Over TCP both callbacks run on the connection's reader thread and must
/// not wait on a response from the same connection.
pub trait Receiver: Send + Sync {
    fn on_message(&self, channel_id: u32, message: Value);

    /// The channel was closed by the peer or by connection loss.
    fn on_channel_closed(&self, _channel_id: u32) {}
}

/// One logical channel.
pub trait Channel: Send + Sync {
    fn id(&self) -> u32;

    fn is_open(&self) -> bool;

    fn message_factory(&self) -> MessageFactory;

    /// Send a request and wait for its response.
    fn request(&self, request: Request) -> Result<Value>;

    /// Close the channel. Closing a closed channel is a no-op.
    fn close(&self) -> Result<()>;

    fn protocol(&self) -> Protocol {
        self.message_factory().protocol()
    }
}

/// One physical connection.
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Open a new channel for `protocol`.
    fn open_channel(
        &self,
        protocol: Protocol,
        name: &str,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>>;

    /// Bind to the proxy-side channel identified by `uri`.
    fn accept_channel(
        &self,
        uri: &ChannelUri,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>>;

    /// Close the connection and all of its channels.
    fn close(&self) -> Result<()>;
}

/// Connection lifecycle callbacks.
pub trait ConnectionListener: Send + Sync {
    fn connection_opened(&self, connection_id: u64);

    fn connection_closed(&self, connection_id: u64);

    fn connection_error(&self, connection_id: u64, error: &crate::Error);
}

/// Establishes connections.
pub trait ConnectionInitiator: Send + Sync {
    /// Connect to `address` (transports without addressing ignore it).
    fn connect(
        &self,
        address: Option<SocketAddr>,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<Arc<dyn Connection>>;
}

/// Listener for short-lived connections nobody watches.
pub(crate) struct IgnoreEvents;

impl ConnectionListener for IgnoreEvents {
    fn connection_opened(&self, _connection_id: u64) {}

    fn connection_closed(&self, _connection_id: u64) {}

    fn connection_error(&self, _connection_id: u64, _error: &crate::Error) {}
}

/// A listener reference that never upgrades.
pub(crate) fn detached_listener() -> Weak<dyn ConnectionListener> {
    Weak::<IgnoreEvents>::new()
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Notify `listener` of a transport-initiated close or failure.
pub(crate) fn report_loss(
    listener: &Weak<dyn ConnectionListener>,
    connection_id: u64,
    error: Option<&crate::Error>,
) {
    let Some(listener) = listener.upgrade() else {
        return;
    };
    match error {
        Some(e) => {
            log::debug!("[CONN] connection {} failed: {}", connection_id, e);
            listener.connection_error(connection_id, e);
        }
        None => {
            log::debug!("[CONN] connection {} closed by peer", connection_id);
            listener.connection_closed(connection_id);
        }
    }
}
