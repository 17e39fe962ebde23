// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram name-service responder.
//!
//! Answers [`LookupRequest`]s for its cluster by running a name-service
//! `Lookup` against the backend. Lookups for other clusters and malformed
//! datagrams are ignored.

use super::backend::{HandlerReply, ProxyBackend, Target};
use crate::error::{Error, Result};
use crate::net::{Received, SocketOptions, UdpSocket};
use crate::protocol::{
    LookupReply, LookupRequest, LookupStatus, Protocol, Request, Value, MAX_DATAGRAM_SIZE,
};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RECEIVE_POLL: Duration = Duration::from_millis(200);

/// UDP responder for name-service discovery.
pub struct NameServiceResponder {
    socket: Arc<UdpSocket>,
    cluster: String,
    backend: Arc<dyn ProxyBackend>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NameServiceResponder {
    /// Bind to `address`. A multicast address joins the group on a wildcard
    /// socket bound to the group port.
    pub fn bind(
        address: SocketAddr,
        cluster: impl Into<String>,
        backend: Arc<dyn ProxyBackend>,
    ) -> Result<Self> {
        let (bind_address, group) = match address.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => (
                SocketAddr::new(IpAddr::from([0, 0, 0, 0]), address.port()),
                Some(ip),
            ),
            _ => (address, None),
        };
        let socket = UdpSocket::new(bind_address, SocketOptions::default());
        socket.open()?;
        if let Some(group) = group {
            socket.join_multicast(group)?;
        }
        socket.set_read_timeout(Some(RECEIVE_POLL))?;
        let cluster = cluster.into();
        log::info!(
            "[NAMESVC] responding on {} for cluster '{}'",
            socket.local_address(),
            cluster
        );
        Ok(Self {
            socket: Arc::new(socket),
            cluster,
            backend,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.socket.local_address()
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("responder already started".into()));
        }
        let socket = Arc::clone(&self.socket);
        let backend = Arc::clone(&self.backend);
        let running = Arc::clone(&self.running);
        let cluster = self.cluster.clone();

        let handle = thread::Builder::new()
            .name("extend-namesvc".into())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                while running.load(Ordering::Acquire) {
                    match socket.receive(&mut buf) {
                        Ok(Received::Packet { len, from }) => {
                            if let Some(reply) = answer(&cluster, backend.as_ref(), &buf[..len]) {
                                if let Err(e) = socket.send_to(&reply.encode(), from) {
                                    log::debug!("[NAMESVC] reply to {} failed: {}", from, e);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(Error::ConnectionClosed) => break,
                        Err(e) => {
                            log::debug!("[NAMESVC] receive failed: {}", e);
                            thread::sleep(RECEIVE_POLL);
                        }
                    }
                }
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.socket.close();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NameServiceResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn answer(cluster: &str, backend: &dyn ProxyBackend, datagram: &[u8]) -> Option<LookupReply> {
    let request = match LookupRequest::decode(datagram) {
        Ok(request) => request,
        Err(e) => {
            log::trace!("[NAMESVC] ignoring datagram: {}", e);
            return None;
        }
    };
    if request.cluster != cluster {
        log::trace!("[NAMESVC] ignoring lookup for cluster '{}'", request.cluster);
        return None;
    }

    let result = backend.handle(
        &Target::Service(Protocol::NameService),
        Request::Lookup {
            name: request.name.clone(),
        },
        None,
    );
    let reply = match result {
        Ok((HandlerReply::Value(Value::Null), _)) => LookupReply {
            status: LookupStatus::NotFound,
            value: Value::Null,
        },
        Ok((HandlerReply::Value(value), _)) => LookupReply {
            status: LookupStatus::Found,
            value,
        },
        Ok((HandlerReply::Bind { .. }, _)) => LookupReply {
            status: LookupStatus::Failed,
            value: Value::from("lookup produced a channel binding"),
        },
        Err(e) => LookupReply {
            status: LookupStatus::Failed,
            value: Value::from(e.to_string()),
        },
    };
    log::debug!("[NAMESVC] lookup '{}' -> {:?}", request.name, reply.status);
    Some(reply)
}
