// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote service base.
//!
//! Every concrete service composes one [`RemoteService`]. It owns the
//! physical connection and the service-level channel, resolves the proxy
//! address, and forgets a dead connection so the next call reconnects.
//! The concrete service is the connection listener: it cleans up its own
//! resource proxies and then delegates to the handlers here.

use super::address::{parse_address_reply, AddressProvider, ListAddressProvider};
use super::close_on_exit::CloseOnExit;
use super::name::discovery_lookup;
use super::scope::Subject;
use super::store::LockWait;
use crate::config::ServiceDependencies;
use crate::connection::{
    detached_listener, Channel, Connection, ConnectionInitiator, ConnectionListener, Receiver,
    TcpInitiator,
};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventKind, ResourceEvent, ResourceType};
use crate::protocol::{ChannelUri, Protocol, Request, Value};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Name used for an empty resource name.
pub const DEFAULT_RESOURCE_NAME: &str = "Default";

/// Empty names map to [`DEFAULT_RESOURCE_NAME`].
pub fn normalize_name(name: &str) -> &str {
    if name.is_empty() {
        DEFAULT_RESOURCE_NAME
    } else {
        name
    }
}

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Collaborators injected into a service.
#[derive(Clone)]
pub struct ServiceContext {
    pub initiator: Arc<dyn ConnectionInitiator>,
    pub events: Arc<EventDispatcher>,
}

impl ServiceContext {
    pub fn new(initiator: Arc<dyn ConnectionInitiator>) -> Self {
        Self {
            initiator,
            events: Arc::new(EventDispatcher::new()),
        }
    }

    /// TCP transport configured from `deps`.
    pub fn tcp(deps: &ServiceDependencies) -> Self {
        Self::new(Arc::new(TcpInitiator::from_dependencies(deps)))
    }

    /// Share one dispatcher between several services.
    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }
}

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initial,
    Running,
    Stopped,
}

/// Live connection plus the service channel opened on it.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) channel: Arc<dyn Channel>,
}

impl Link {
    fn is_live(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }
}

/// Connection lifecycle shared by every remote service.
pub struct RemoteService {
    id: u64,
    name: String,
    protocol: Protocol,
    deps: ServiceDependencies,
    initiator: Arc<dyn ConnectionInitiator>,
    events: Arc<EventDispatcher>,
    addresses: ListAddressProvider,
    state: Mutex<ServiceState>,
    link: Mutex<Option<Link>>,
    listener: Weak<dyn ConnectionListener>,
    close_on_exit: CloseOnExit,
}

impl RemoteService {
    /// Validate `deps` and build an unstarted service speaking `protocol`.
    pub fn new(
        name: &str,
        protocol: Protocol,
        deps: ServiceDependencies,
        context: ServiceContext,
    ) -> Result<Self> {
        deps.validate()?;
        let addresses = ListAddressProvider::parse(&deps.proxy_addresses)?;
        let name = normalize_name(name).to_string();
        Ok(Self {
            id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
            close_on_exit: CloseOnExit::new(&name),
            name,
            protocol,
            deps,
            initiator: context.initiator,
            events: context.events,
            addresses,
            state: Mutex::new(ServiceState::Initial),
            link: Mutex::new(None),
            listener: detached_listener(),
        })
    }

    /// Register the listener connections report to.
    pub(crate) fn with_listener(mut self, listener: Weak<dyn ConnectionListener>) -> Self {
        self.listener = listener;
        self
    }

    // ===== Accessors =====

    /// Identity used to check resource ownership.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn dependencies(&self) -> &ServiceDependencies {
        &self.deps
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn close_on_exit(&self) -> &CloseOnExit {
        &self.close_on_exit
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn lock_wait(&self) -> LockWait {
        self.deps.lock_wait()
    }

    /// The current connection, if one is established.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.link.lock().as_ref().map(|l| Arc::clone(&l.connection))
    }

    pub fn is_current_connection(&self, connection_id: u64) -> bool {
        self.link
            .lock()
            .as_ref()
            .map_or(false, |l| l.connection.id() == connection_id)
    }

    // ===== Lifecycle =====

    /// Start the service and connect to the proxy.
    pub fn start(&self) -> Result<()> {
        if !self.mark_running() {
            return Ok(());
        }
        if let Err(e) = self.ensure_link() {
            log::warn!("[SERVICE] {}: start failed: {}", self.name, e);
            let mut state = self.state.lock();
            // a concurrent stop() wins
            if *state == ServiceState::Running {
                *state = ServiceState::Initial;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Enter `Running` without connecting. Returns false if already running.
    pub(crate) fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ServiceState::Running {
            return false;
        }
        self.close_on_exit.reopen();
        *state = ServiceState::Running;
        if self.lock_wait().is_indefinite() {
            log::warn!(
                "[SERVICE] {}: request timeout {}ms; resource locks wait indefinitely",
                self.name,
                self.deps.request_timeout_ms
            );
        }
        log::info!("[SERVICE] {} started ({})", self.name, self.protocol);
        true
    }

    /// Stop abruptly: interrupt blocked calls and close the connection.
    pub fn stop(&self) {
        if let Some(link) = self.halt() {
            if let Err(e) = link.connection.close() {
                log::debug!("[SERVICE] {}: closing connection failed: {}", self.name, e);
            }
        }
        log::info!("[SERVICE] {} stopped", self.name);
    }

    /// Stop gracefully: close the service channel, then the connection.
    pub fn shutdown(&self) {
        if let Some(link) = self.halt() {
            if let Err(e) = link.channel.close() {
                log::debug!("[SERVICE] {}: closing service channel failed: {}", self.name, e);
            }
            if let Err(e) = link.connection.close() {
                log::debug!("[SERVICE] {}: closing connection failed: {}", self.name, e);
            }
        }
        log::info!("[SERVICE] {} shut down", self.name);
    }

    fn halt(&self) -> Option<Link> {
        *self.state.lock() = ServiceState::Stopped;
        self.close_on_exit.close_all();
        // Taken out before closing: a close may call back into the listener.
        self.link.lock().take()
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::ServiceStopped(self.name.clone()))
        }
    }

    // ===== Channels =====

    /// The live service channel, connecting first if needed.
    pub fn ensure_channel(&self) -> Result<Arc<dyn Channel>> {
        self.ensure_link().map(|l| l.channel)
    }

    pub(crate) fn ensure_link(&self) -> Result<Link> {
        self.check_running()?;
        let mut link = self.link.lock();
        if let Some(current) = link.as_ref() {
            if current.is_live() {
                return Ok(current.clone());
            }
            log::debug!(
                "[SERVICE] {}: connection {} no longer usable, reconnecting",
                self.name,
                current.connection.id()
            );
        }
        let fresh = self.connect()?;
        *link = Some(fresh.clone());
        Ok(fresh)
    }

    /// Open an additional channel on the current connection.
    pub fn open_channel(
        &self,
        protocol: Protocol,
        name: &str,
        receiver: Option<Arc<dyn Receiver>>,
    ) -> Result<Arc<dyn Channel>> {
        let link = self.ensure_link()?;
        let subject = Subject::current();
        link.connection
            .open_channel(protocol, name, receiver, subject.as_ref())
    }

    /// Bind to a proxy-side channel on the current connection.
    pub fn accept_channel(
        &self,
        uri: &ChannelUri,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>> {
        let connection = self.connection().ok_or(Error::ConnectionClosed)?;
        connection.accept_channel(uri, receiver, subject)
    }

    /// Send `request` on the service channel.
    pub fn request(&self, request: Request) -> Result<Value> {
        self.ensure_channel()?.request(request)
    }

    fn connect(&self) -> Result<Link> {
        let addresses = self.lookup_proxy_service_address()?;
        let subject = Subject::current();
        if addresses.is_empty() {
            return self.connect_to(None, subject.as_ref());
        }

        let mut last_error = None;
        for address in addresses {
            match self.connect_to(Some(address), subject.as_ref()) {
                Ok(link) => {
                    self.addresses.accept(address);
                    return Ok(link);
                }
                Err(e) => {
                    self.addresses.reject(address, &e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::transport("no proxy address")))
    }

    fn connect_to(&self, address: Option<SocketAddr>, subject: Option<&Subject>) -> Result<Link> {
        let connection = self.initiator.connect(address, self.listener.clone())?;
        match connection.open_channel(self.protocol, &self.name, None, subject) {
            Ok(channel) => {
                log::debug!(
                    "[SERVICE] {}: connection {} channel {} open",
                    self.name,
                    connection.id(),
                    channel.id()
                );
                Ok(Link {
                    connection,
                    channel,
                })
            }
            Err(e) => {
                if let Err(close) = connection.close() {
                    log::debug!("[SERVICE] {}: close after failed open: {}", self.name, close);
                }
                Err(e)
            }
        }
    }

    // ===== Proxy address resolution =====

    /// Addresses of the remote proxy service.
    ///
    /// Name-service addresses take precedence, then the datagram discovery
    /// address, then the static list. An empty result means the initiator
    /// needs no address.
    pub fn lookup_proxy_service_address(&self) -> Result<Vec<SocketAddr>> {
        let name_services = self.deps.name_service_socket_addrs()?;
        if !name_services.is_empty() {
            return self.lookup_via_name_service(&name_services);
        }

        if let Some(discovery) = self.deps.discovery_socket_addr()? {
            let reply = discovery_lookup(
                &self.close_on_exit,
                &self.deps.cluster_name,
                &self.deps.remote_service_name,
                discovery,
                self.deps.connect_timeout(),
            )?;
            if reply.is_null() {
                return Err(Error::transport(format!(
                    "proxy service '{}' not registered in cluster '{}'",
                    self.deps.remote_service_name, self.deps.cluster_name
                )));
            }
            return parse_address_reply(&reply);
        }

        Ok(self.addresses.candidates())
    }

    fn lookup_via_name_service(&self, name_services: &[SocketAddr]) -> Result<Vec<SocketAddr>> {
        let mut last_error = None;
        for address in name_services {
            match self.query_name_service(*address) {
                Ok(Value::Null) => {
                    last_error = Some(Error::transport(format!(
                        "proxy service '{}' not found by name service at {}",
                        self.deps.remote_service_name, address
                    )));
                }
                Ok(reply) => {
                    let resolved = parse_address_reply(&reply)?;
                    log::debug!(
                        "[SERVICE] {}: '{}' resolved to {:?} via {}",
                        self.name,
                        self.deps.remote_service_name,
                        resolved,
                        address
                    );
                    return Ok(resolved);
                }
                Err(e) => {
                    log::debug!("[SERVICE] {}: name service {} failed: {}", self.name, address, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::transport("no name service address")))
    }

    fn query_name_service(&self, address: SocketAddr) -> Result<Value> {
        let connection = self.initiator.connect(Some(address), detached_listener())?;
        let outcome = connection
            .open_channel(Protocol::NameService, Protocol::NameService.name(), None, None)
            .and_then(|channel| {
                channel.request(Request::Lookup {
                    name: self.deps.remote_service_name.clone(),
                })
            });
        if let Err(e) = connection.close() {
            log::debug!("[SERVICE] {}: closing name-service connection: {}", self.name, e);
        }
        outcome
    }

    // ===== Events =====

    pub(crate) fn emit(&self, kind: EventKind, resource: ResourceType, name: &str) {
        self.events.dispatch(&ResourceEvent {
            kind,
            resource,
            service: self.name.clone(),
            name: name.to_string(),
        });
    }

    /// Reject resources created by another service.
    pub(crate) fn check_owner(&self, owner: u64, kind: &'static str, name: &str) -> Result<()> {
        if owner == self.id {
            Ok(())
        } else {
            Err(Error::IllegalResource {
                kind,
                name: name.to_string(),
            })
        }
    }

    fn forget(&self, connection_id: u64) -> Option<Link> {
        let mut link = self.link.lock();
        if link
            .as_ref()
            .map_or(false, |l| l.connection.id() == connection_id)
        {
            link.take()
        } else {
            None
        }
    }
}

impl ConnectionListener for RemoteService {
    fn connection_opened(&self, connection_id: u64) {
        log::debug!("[SERVICE] {}: connection {} opened", self.name, connection_id);
    }

    fn connection_closed(&self, connection_id: u64) {
        if self.forget(connection_id).is_some() {
            log::info!("[SERVICE] {}: connection {} closed", self.name, connection_id);
        }
    }

    fn connection_error(&self, connection_id: u64, error: &Error) {
        if self.forget(connection_id).is_some() {
            log::warn!(
                "[SERVICE] {}: connection {} failed: {}",
                self.name,
                connection_id,
                error
            );
        }
    }
}

impl fmt::Debug for RemoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteService")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InProcessInitiator;
    use crate::server::InMemoryBackend;

    fn service(backend: Arc<InMemoryBackend>) -> (RemoteService, Arc<InProcessInitiator>) {
        let initiator = Arc::new(InProcessInitiator::new(backend));
        let service = RemoteService::new(
            "cache",
            Protocol::CacheService,
            ServiceDependencies::default(),
            ServiceContext::new(initiator.clone()),
        )
        .unwrap();
        (service, initiator)
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name(""), DEFAULT_RESOURCE_NAME);
        assert_eq!(normalize_name("orders"), "orders");
    }

    #[test]
    fn test_channel_requires_running_service() {
        let (service, initiator) = service(Arc::new(InMemoryBackend::new()));
        assert!(matches!(service.ensure_channel(), Err(Error::ServiceStopped(_))));

        service.start().unwrap();
        let first = service.ensure_channel().unwrap();
        let again = service.ensure_channel().unwrap();
        assert_eq!(first.id(), again.id());
        assert_eq!(initiator.connect_count(), 1);

        service.stop();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(service.connection().is_none());
        assert!(!first.is_open());
    }

    #[test]
    fn test_closed_connection_is_forgotten() {
        let (service, initiator) = service(Arc::new(InMemoryBackend::new()));
        service.start().unwrap();
        let id = service.connection().unwrap().id();
        assert!(service.is_current_connection(id));

        service.connection_closed(id + 1000);
        assert!(service.is_current_connection(id));
        service.connection_closed(id);
        assert!(service.connection().is_none());

        service.ensure_channel().unwrap();
        assert_eq!(initiator.connect_count(), 2);
    }

    #[test]
    fn test_proxy_address_from_name_service() {
        let backend = Arc::new(InMemoryBackend::new());
        let proxy: SocketAddr = "127.0.0.1:9099".parse().unwrap();
        backend.bind_proxy_address("ExtendProxy", proxy);

        let initiator = Arc::new(InProcessInitiator::new(backend));
        let deps = ServiceDependencies::default().with_name_service_address("127.0.0.1:7574");
        let service = RemoteService::new(
            "cache",
            Protocol::CacheService,
            deps,
            ServiceContext::new(initiator),
        )
        .unwrap();
        assert_eq!(service.lookup_proxy_service_address().unwrap(), vec![proxy]);
    }

    #[test]
    fn test_unknown_proxy_service_fails_lookup() {
        let initiator = Arc::new(InProcessInitiator::new(Arc::new(InMemoryBackend::new())));
        let deps = ServiceDependencies::default().with_name_service_address("127.0.0.1:7574");
        let service = RemoteService::new(
            "cache",
            Protocol::CacheService,
            deps,
            ServiceContext::new(initiator),
        )
        .unwrap();
        assert!(matches!(
            service.lookup_proxy_service_address(),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_ownership_check() {
        let (service, _) = service(Arc::new(InMemoryBackend::new()));
        assert!(service.check_owner(service.id(), "cache", "a").is_ok());
        assert!(matches!(
            service.check_owner(service.id() + 1, "cache", "a"),
            Err(Error::IllegalResource { .. })
        ));
    }
}
