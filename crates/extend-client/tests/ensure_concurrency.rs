// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability

//! Concurrent `ensure_cache` / `ensure_topic` behavior.
//!
//! Covers at-most-one creation per `(name, scope)`, the lock-free fast path,
//! lock timeouts and ownership validation on destroy.

mod common;

use common::{CountingBackend, TrackingInitiator};
use extend_client::service::{LockWait, Subject};
use extend_client::{
    Error, ErrorKind, RemoteCacheService, RemoteTopicService, Scope, ServiceContext,
    ServiceDependencies,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn cache_service(
    backend: &Arc<CountingBackend>,
    deps: ServiceDependencies,
) -> Arc<RemoteCacheService> {
    let initiator = TrackingInitiator::new(backend.clone());
    let service = RemoteCacheService::new(deps, ServiceContext::new(initiator)).unwrap();
    service.start().unwrap();
    service
}

#[test]
fn test_concurrent_ensure_creates_once() {
    const THREADS: usize = 8;

    let backend = CountingBackend::new();
    backend.delay_creation(Duration::from_millis(50));
    let service = cache_service(&backend, ServiceDependencies::default());
    let scope = Scope::new("app");
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let service = Arc::clone(&service);
            let scope = scope.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                service.ensure_cache("orders", Some(&scope)).unwrap()
            })
        })
        .collect();
    let caches: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(backend.count("EnsureCache"), 1);
    for cache in &caches[1..] {
        assert!(Arc::ptr_eq(&caches[0], cache));
    }
    assert_eq!(service.reference_store().len(), 1);
}

#[test]
fn test_distinct_scopes_get_distinct_proxies() {
    let backend = CountingBackend::new();
    let service = cache_service(&backend, ServiceDependencies::default());

    let a = service.ensure_cache("orders", Some(&Scope::new("a"))).unwrap();
    let b = service.ensure_cache("orders", Some(&Scope::new("a"))).unwrap();
    assert!(!Arc::ptr_eq(&a, &b), "scopes compare by identity");
    assert_eq!(backend.count("EnsureCache"), 2);

    // both proxies see the same remote cache
    a.put(b"k", b"v").unwrap();
    assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_second_ensure_skips_name_lock() {
    let backend = CountingBackend::new();
    let deps = ServiceDependencies::default().with_request_timeout_ms(200);
    let service = cache_service(&backend, deps);
    let scope = Scope::new("app");

    let first = service.ensure_cache("orders", Some(&scope)).unwrap();

    // Holding the name lock on this thread: a second lookup that tried to
    // take it would time out instead of returning.
    let _held = service
        .reference_store()
        .lock("orders", LockWait::Indefinite)
        .unwrap();
    let started = Instant::now();
    let second = service.ensure_cache("orders", Some(&scope)).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(backend.count("EnsureCache"), 1);
}

#[test]
fn test_lock_timeout_names_resource_and_timeout() {
    let backend = CountingBackend::new();
    let deps = ServiceDependencies::default().with_request_timeout_ms(150);
    let service = cache_service(&backend, deps);

    let _held = service
        .reference_store()
        .lock("orders", LockWait::Indefinite)
        .unwrap();

    let contender = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let started = Instant::now();
            let outcome = service.ensure_cache("orders", Some(&Scope::new("app")));
            (outcome, started.elapsed())
        })
    };
    let (outcome, waited) = contender.join().unwrap();

    let err = outcome.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    match &err {
        Error::Timeout {
            resource,
            waited_ms,
        } => {
            assert_eq!(resource, "orders");
            assert_eq!(*waited_ms, 150);
        }
        other => panic!("unexpected {:?}", other),
    }
    let message = err.to_string();
    assert!(message.contains("orders"), "{}", message);
    assert!(message.contains("150"), "{}", message);
    assert!(waited >= Duration::from_millis(150));
    assert_eq!(backend.count("EnsureCache"), 0);
}

#[test]
fn test_failed_creation_stores_nothing() {
    let backend = CountingBackend::new();
    let service = cache_service(&backend, ServiceDependencies::default());
    let scope = Scope::new("app");

    service.stop();
    assert!(matches!(
        service.ensure_cache("orders", Some(&scope)),
        Err(Error::ServiceStopped(_))
    ));
    assert!(service.reference_store().is_empty());
}

#[test]
fn test_destroy_rejects_foreign_cache() {
    let backend = CountingBackend::new();
    let owner = cache_service(&backend, ServiceDependencies::default());
    let other = cache_service(&backend, ServiceDependencies::default());
    let scope = Scope::new("app");

    let cache = owner.ensure_cache("orders", Some(&scope)).unwrap();
    let before = backend.total();

    let err = other.destroy_cache(&cache).unwrap_err();
    assert!(matches!(err, Error::IllegalResource { .. }), "{:?}", err);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(other.release_cache(&cache).is_err());
    assert_eq!(backend.total(), before, "no request may be sent");
    assert_eq!(backend.count("DestroyCache"), 0);

    // the rightful owner is unaffected
    assert!(cache.is_active());
    owner.destroy_cache(&cache).unwrap();
    assert_eq!(backend.count("DestroyCache"), 1);
}

#[test]
fn test_concurrent_ensure_topic_creates_once() {
    const THREADS: usize = 6;

    let backend = CountingBackend::new();
    backend.delay_creation(Duration::from_millis(30));
    let initiator = TrackingInitiator::new(backend.clone());
    let service =
        RemoteTopicService::new(ServiceDependencies::default(), ServiceContext::new(initiator))
            .unwrap();
    service.start().unwrap();
    let scope = Scope::new("app");
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let service = Arc::clone(&service);
            let scope = scope.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                service.ensure_topic("events", Some(&scope)).unwrap()
            })
        })
        .collect();
    let topics: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(backend.count("EnsureTopic"), 1);
    assert!(topics.iter().all(|t| Arc::ptr_eq(t, &topics[0])));
}

#[test]
fn test_subject_scoped_service_keys_by_subject() {
    let backend = CountingBackend::new();
    let deps = ServiceDependencies::default().with_subject_scoped(true);
    let service = cache_service(&backend, deps);
    let scope = Scope::new("app");

    let alice = {
        let _subject = Subject::new("alice").enter();
        service.ensure_cache("orders", Some(&scope)).unwrap()
    };
    let bob = {
        let _subject = Subject::new("bob").enter();
        service.ensure_cache("orders", Some(&scope)).unwrap()
    };
    let alice_again = {
        let _subject = Subject::new("alice").enter();
        service.ensure_cache("orders", Some(&scope)).unwrap()
    };

    assert!(!Arc::ptr_eq(&alice, &bob));
    assert!(Arc::ptr_eq(&alice, &alice_again));
    assert_eq!(backend.count("EnsureCache"), 2);
    assert_eq!(service.reference_store().len(), 2);
}

#[test]
fn test_unscoped_service_shares_proxy_across_subjects() {
    let backend = CountingBackend::new();
    let service = cache_service(&backend, ServiceDependencies::default());
    let scope = Scope::new("app");

    let alice = {
        let _subject = Subject::new("alice").enter();
        service.ensure_cache("orders", Some(&scope)).unwrap()
    };
    let bob = {
        let _subject = Subject::new("bob").enter();
        service.ensure_cache("orders", Some(&scope)).unwrap()
    };

    assert!(Arc::ptr_eq(&alice, &bob));
    assert_eq!(backend.count("EnsureCache"), 1);
    assert_eq!(service.reference_store().len(), 1);
}

#[test]
fn test_name_locks_do_not_outlive_creation() {
    let backend = CountingBackend::new();
    let service = cache_service(&backend, ServiceDependencies::default());
    let scope = Scope::new("app");

    for i in 0..1000 {
        let cache = service
            .ensure_cache(&format!("session-{}", i), Some(&scope))
            .unwrap();
        cache.release().unwrap();
    }

    assert!(service.reference_store().is_empty());
    assert_eq!(service.reference_store().lock_count(), 0);
    assert_eq!(backend.count("EnsureCache"), 1000);
}
