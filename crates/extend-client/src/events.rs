// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resource lifecycle notifications.
//!
//! Services dispatch a [`ResourceEvent`] when a cache or topic proxy is
//! created, released or destroyed. Listeners subscribe with an
//! [`EventFilter`]; every field left unset matches anything.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Released,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Cache,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub resource: ResourceType,
    pub service: String,
    pub name: String,
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} '{}' on service '{}'",
            self.kind, self.resource, self.name, self.service
        )
    }
}

/// Predicate over events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Vec<EventKind>,
    resource: Option<ResourceType>,
    service: Option<String>,
    name: Option<String>,
}

impl EventFilter {
    /// Match every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn resource(mut self, resource: ResourceType) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn matches(&self, event: &ResourceEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && self.resource.map_or(true, |r| r == event.resource)
            && self.service.as_deref().map_or(true, |s| s == event.service)
            && self.name.as_deref().map_or(true, |n| n == event.name)
    }
}

/// Receives resource events.
///
/// Events run on the thread that caused them. A topic destroyed through
/// another proxy is reported from the connection's reader thread
/// (`extend-conn-*`), so a listener must not make requests on that
/// connection from `on_event`: the reply can only be read by the thread it
/// is blocking. Hand such work to another thread.
pub trait ResourceListener: Send + Sync {
    fn on_event(&self, event: &ResourceEvent);
}

impl<F> ResourceListener for F
where
    F: Fn(&ResourceEvent) + Send + Sync,
{
    fn on_event(&self, event: &ResourceEvent) {
        self(event)
    }
}

/// Handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    filter: EventFilter,
    listener: Arc<dyn ResourceListener>,
}

/// Fan-out of resource events to filtered listeners.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L>(&self, filter: EventFilter, listener: L) -> ListenerId
    where
        L: ResourceListener + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration {
            id,
            filter,
            listener: Arc::new(listener),
        });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to matching listeners. Listeners run outside the lock.
    pub fn dispatch(&self, event: &ResourceEvent) {
        let targets: Vec<Arc<dyn ResourceListener>> = self
            .listeners
            .read()
            .iter()
            .filter(|r| r.filter.matches(event))
            .map(|r| Arc::clone(&r.listener))
            .collect();
        log::trace!("[EVENTS] {} -> {} listener(s)", event, targets.len());
        for listener in targets {
            listener.on_event(event);
        }
    }
}
