// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote name service.
//!
//! Lookups normally run over the service channel. With a discovery address
//! configured they go out as datagrams instead (see [`discovery_lookup`]).

use super::base::{RemoteService, ServiceContext};
use super::close_on_exit::CloseOnExit;
use super::deadline::Deadline;
use crate::config::{ServiceDependencies, DEFAULT_CONNECT_TIMEOUT_MS};
use crate::connection::ConnectionListener;
use crate::error::{Error, Result};
use crate::net::{duration_to_ms, Received, SocketOptions, UdpSocket};
use crate::protocol::{LookupReply, LookupRequest, Protocol, Request, Value, MAX_DATAGRAM_SIZE};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Interval between datagram retransmissions.
const RESEND_INTERVAL: Duration = Duration::from_millis(250);

/// Name service client.
pub struct RemoteNameService {
    base: RemoteService,
}

impl RemoteNameService {
    pub const DEFAULT_NAME: &'static str = "RemoteNameService";

    pub fn new(deps: ServiceDependencies, context: ServiceContext) -> Result<Arc<Self>> {
        let base = RemoteService::new(Self::DEFAULT_NAME, Protocol::NameService, deps, context)?;
        Ok(Arc::new_cyclic(move |weak: &Weak<Self>| Self {
            base: base.with_listener(weak.clone()),
        }))
    }

    pub fn base(&self) -> &RemoteService {
        &self.base
    }

    /// Start the service. Datagram lookups need no connection, so with a
    /// discovery address configured nothing is connected up front.
    pub fn start(&self) -> Result<()> {
        if self.base.dependencies().discovery_address.is_some() {
            self.base.mark_running();
            Ok(())
        } else {
            self.base.start()
        }
    }

    /// Stop; interrupts lookups blocked on a datagram reply.
    pub fn stop(&self) {
        self.base.stop();
    }

    pub fn shutdown(&self) {
        self.base.shutdown();
    }

    /// Look `name` up; `Value::Null` when nothing is bound.
    pub fn lookup(&self, name: &str) -> Result<Value> {
        self.base.check_running()?;
        let deps = self.base.dependencies();
        match deps.discovery_socket_addr()? {
            Some(address) => discovery_lookup(
                self.base.close_on_exit(),
                &deps.cluster_name,
                name,
                address,
                deps.connect_timeout(),
            ),
            None => self.base.request(Request::Lookup {
                name: name.to_string(),
            }),
        }
    }
}

impl ConnectionListener for RemoteNameService {
    fn connection_opened(&self, connection_id: u64) {
        self.base.connection_opened(connection_id);
    }

    fn connection_closed(&self, connection_id: u64) {
        self.base.connection_closed(connection_id);
    }

    fn connection_error(&self, connection_id: u64, error: &Error) {
        self.base.connection_error(connection_id, error);
    }
}

/// Query a datagram name-service responder.
///
/// Keyed by `(cluster, name)`. Waits at most `min(timeout, ambient
/// deadline)`; with neither set the default connect timeout applies. The
/// request is resent every [`RESEND_INTERVAL`] until a matching reply
/// arrives. Closing `registry` interrupts the wait with
/// [`Error::Interrupted`].
pub(crate) fn discovery_lookup(
    registry: &CloseOnExit,
    cluster: &str,
    name: &str,
    address: SocketAddr,
    timeout: Option<Duration>,
) -> Result<Value> {
    let window = Deadline::bound(timeout)
        .unwrap_or(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS));
    let wildcard = match address.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = Arc::new(UdpSocket::new(
        SocketAddr::new(wildcard, 0),
        SocketOptions::default(),
    ));
    socket.open()?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let registration = {
        let socket = Arc::clone(&socket);
        let cancelled = Arc::clone(&cancelled);
        registry.register(move || {
            cancelled.store(true, Ordering::Release);
            socket.close();
        })
    };
    let registration = match registration {
        Ok(registration) => registration,
        Err(e) => {
            socket.close();
            return Err(e);
        }
    };

    let request = LookupRequest {
        cluster: cluster.to_string(),
        name: name.to_string(),
    }
    .encode();
    let outcome = wait_for_reply(&socket, &request, address, window, &cancelled);
    drop(registration);
    socket.close();

    let outcome = outcome.map_err(|e| match e {
        _ if cancelled.load(Ordering::Acquire) => {
            Error::Interrupted(format!("name lookup '{}'", name))
        }
        Error::RequestTimeout { .. } => Error::RequestTimeout {
            operation: format!("name lookup '{}' in cluster '{}'", name, cluster),
            timeout_ms: duration_to_ms(window),
        },
        other => other,
    });
    log::debug!(
        "[NAMESVC] lookup '{}' via {} -> {}",
        name,
        address,
        match &outcome {
            Ok(value) => value.to_string(),
            Err(e) => e.to_string(),
        }
    );
    outcome
}

fn wait_for_reply(
    socket: &UdpSocket,
    request: &[u8],
    address: SocketAddr,
    window: Duration,
    cancelled: &AtomicBool,
) -> Result<Value> {
    let started = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut next_send = started;

    loop {
        if cancelled.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let elapsed = started.elapsed();
        if elapsed >= window {
            return Err(Error::RequestTimeout {
                operation: String::new(),
                timeout_ms: duration_to_ms(window),
            });
        }

        let now = Instant::now();
        if now >= next_send {
            socket.send_to(request, address)?;
            next_send = now + RESEND_INTERVAL;
        }
        let wait = next_send
            .saturating_duration_since(now)
            .min(window - elapsed)
            .max(Duration::from_millis(1));
        socket.set_read_timeout(Some(wait))?;

        match socket.receive(&mut buf)? {
            Received::Packet { len, from } => match LookupReply::decode(&buf[..len]) {
                Ok(reply) => return reply.into_result(),
                Err(e) => log::trace!("[NAMESVC] ignoring datagram from {}: {}", from, e),
            },
            Received::TimedOut | Received::Rebound | Received::Dropped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{InMemoryBackend, NameServiceResponder};
    use std::thread;

    #[test]
    fn test_discovery_lookup_round_trip() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.bind_name("svc", Value::from("bound"));
        let responder =
            NameServiceResponder::bind("127.0.0.1:0".parse().unwrap(), "prod", backend).unwrap();
        responder.start().unwrap();

        let registry = CloseOnExit::new("test");
        let found = discovery_lookup(
            &registry,
            "prod",
            "svc",
            responder.local_address(),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        assert_eq!(found, Value::from("bound"));

        let missing = discovery_lookup(
            &registry,
            "prod",
            "nothing",
            responder.local_address(),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        assert!(missing.is_null());
        assert_eq!(registry.pending(), 0);
        responder.stop();
    }

    #[test]
    fn test_discovery_lookup_times_out() {
        // Nothing answers on this socket.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let registry = CloseOnExit::new("test");
        let started = Instant::now();
        let err = discovery_lookup(
            &registry,
            "prod",
            "svc",
            silent.local_addr().unwrap(),
            Some(Duration::from_millis(300)),
        )
        .unwrap_err();
        assert!(err.is_timeout(), "unexpected {:?}", err);
        assert!(err.to_string().contains("300"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_discovery_lookup_interrupted_by_close() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = silent.local_addr().unwrap();
        let registry = CloseOnExit::new("test");

        let closer = registry.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            closer.close_all();
        });
        let err = discovery_lookup(&registry, "prod", "svc", target, Some(Duration::from_secs(10)))
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, Error::Interrupted(_)), "unexpected {:?}", err);
    }

    #[test]
    fn test_lookup_refused_after_close() {
        let registry = CloseOnExit::new("test");
        registry.close_all();
        let err = discovery_lookup(
            &registry,
            "prod",
            "svc",
            "127.0.0.1:9".parse().unwrap(),
            Some(Duration::from_millis(50)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ServiceStopped(_)));
    }
}
