// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability

//! Name resolution: datagram lookups, proxy address discovery and
//! interruption of blocked lookups by `stop()`.

use extend_client::connection::InProcessInitiator;
use extend_client::server::{InMemoryBackend, NameServiceResponder};
use extend_client::service::{Deadline, ServiceState};
use extend_client::{
    Error, RemoteCacheService, RemoteNameService, ServiceContext, ServiceDependencies, Value,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn in_process(backend: &Arc<InMemoryBackend>) -> ServiceContext {
    ServiceContext::new(Arc::new(InProcessInitiator::new(backend.clone())))
}

/// A bound UDP socket that never answers.
fn silent_peer() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

#[test]
fn test_lookup_over_channel() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.bind_name("config/region", Value::from("eu-west"));
    let service =
        RemoteNameService::new(ServiceDependencies::default(), in_process(&backend)).unwrap();
    service.start().unwrap();

    assert_eq!(service.lookup("config/region").unwrap(), Value::from("eu-west"));
    assert!(service.lookup("config/unknown").unwrap().is_null());
    service.shutdown();
}

#[test]
fn test_lookup_over_datagrams() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.bind_name("svc", Value::from(7i64));
    let responder =
        NameServiceResponder::bind("127.0.0.1:0".parse().unwrap(), "prod", backend.clone())
            .unwrap();
    responder.start().unwrap();

    let deps = ServiceDependencies::default()
        .with_cluster_name("prod")
        .with_discovery_address(responder.local_address().to_string());
    let initiator = Arc::new(InProcessInitiator::new(backend.clone()));
    let service =
        RemoteNameService::new(deps, ServiceContext::new(initiator.clone())).unwrap();
    service.start().unwrap();

    assert_eq!(service.lookup("svc").unwrap(), Value::from(7i64));
    // datagram lookups never open a connection
    assert_eq!(initiator.connect_count(), 0);
    responder.stop();
}

#[test]
fn test_wrong_cluster_gets_no_answer() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.bind_name("svc", Value::from("bound"));
    let responder =
        NameServiceResponder::bind("127.0.0.1:0".parse().unwrap(), "prod", backend.clone())
            .unwrap();
    responder.start().unwrap();

    let deps = ServiceDependencies::default()
        .with_cluster_name("staging")
        .with_connect_timeout(Duration::from_millis(400))
        .with_discovery_address(responder.local_address().to_string());
    let service = RemoteNameService::new(deps, in_process(&backend)).unwrap();
    service.start().unwrap();

    let err = service.lookup("svc").unwrap_err();
    assert!(err.is_timeout(), "unexpected {:?}", err);
    assert!(err.to_string().contains("staging"), "{}", err);
    responder.stop();
}

#[test]
fn test_ambient_deadline_shortens_lookup() {
    let (_peer, addr) = silent_peer();
    let backend = Arc::new(InMemoryBackend::new());
    let deps = ServiceDependencies::default()
        .with_connect_timeout(Duration::from_secs(10))
        .with_discovery_address(addr.to_string());
    let service = RemoteNameService::new(deps, in_process(&backend)).unwrap();
    service.start().unwrap();

    let started = Instant::now();
    let err = {
        let _deadline = Deadline::after(Duration::from_millis(200));
        service.lookup("svc").unwrap_err()
    };
    assert!(err.is_timeout(), "unexpected {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_stop_interrupts_blocked_lookup() {
    let (_peer, addr) = silent_peer();
    let backend = Arc::new(InMemoryBackend::new());
    let deps = ServiceDependencies::default()
        .with_connect_timeout(Duration::from_secs(30))
        .with_discovery_address(addr.to_string());
    let service = RemoteNameService::new(deps, in_process(&backend)).unwrap();
    service.start().unwrap();

    let lookup = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let started = Instant::now();
            (service.lookup("svc"), started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(150));
    service.stop();

    let (outcome, elapsed) = lookup.join().unwrap();
    assert!(matches!(outcome, Err(Error::Interrupted(_))), "{:?}", outcome);
    assert!(elapsed < Duration::from_secs(10));
    assert!(matches!(service.lookup("svc"), Err(Error::ServiceStopped(_))));
}

#[test]
fn test_stop_interrupts_proxy_discovery_during_start() {
    let (_peer, addr) = silent_peer();
    let backend = Arc::new(InMemoryBackend::new());
    let deps = ServiceDependencies::default()
        .with_connect_timeout(Duration::from_secs(30))
        .with_discovery_address(addr.to_string());
    let service = RemoteCacheService::new(deps, in_process(&backend)).unwrap();

    let starter = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.start())
    };
    thread::sleep(Duration::from_millis(150));
    service.stop();

    let outcome = starter.join().unwrap();
    assert!(matches!(outcome, Err(Error::Interrupted(_))), "{:?}", outcome);
    assert_eq!(service.base().state(), ServiceState::Stopped);
}

#[test]
fn test_proxy_address_resolved_by_discovery() {
    let backend = Arc::new(InMemoryBackend::new());
    let proxy: SocketAddr = "127.0.0.1:9099".parse().unwrap();
    backend.bind_proxy_address("ExtendProxy", proxy);
    let responder =
        NameServiceResponder::bind("127.0.0.1:0".parse().unwrap(), "extend", backend.clone())
            .unwrap();
    responder.start().unwrap();

    let deps = ServiceDependencies::default()
        .with_discovery_address(responder.local_address().to_string());
    let service = RemoteCacheService::new(deps, in_process(&backend)).unwrap();

    assert_eq!(service.base().lookup_proxy_service_address().unwrap(), vec![proxy]);
    responder.stop();
}
