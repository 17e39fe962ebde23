// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote cache service and named-cache proxies.

use super::base::{normalize_name, RemoteService, ServiceContext};
use super::scope::{Scope, Subject};
use super::store::{ScopedReferenceStore, ScopedResource, StoreKey};
use crate::config::ServiceDependencies;
use crate::connection::{Channel, ConnectionListener};
use crate::error::{Error, Result};
use crate::events::{EventKind, ResourceType};
use crate::protocol::{type_id, ChannelUri, Protocol, Request, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Client for a proxy's cache service.
pub struct RemoteCacheService {
    base: RemoteService,
    store: ScopedReferenceStore<RemoteNamedCache>,
    me: Weak<RemoteCacheService>,
}

impl RemoteCacheService {
    pub const DEFAULT_NAME: &'static str = "RemoteCache";

    pub fn new(deps: ServiceDependencies, context: ServiceContext) -> Result<Arc<Self>> {
        Self::with_name(Self::DEFAULT_NAME, deps, context)
    }

    pub fn with_name(
        name: &str,
        deps: ServiceDependencies,
        context: ServiceContext,
    ) -> Result<Arc<Self>> {
        let base = RemoteService::new(name, Protocol::CacheService, deps, context)?;
        Ok(Arc::new_cyclic(move |weak: &Weak<Self>| Self {
            base: base.with_listener(weak.clone()),
            store: ScopedReferenceStore::new(),
            me: weak.clone(),
        }))
    }

    pub fn base(&self) -> &RemoteService {
        &self.base
    }

    pub fn reference_store(&self) -> &ScopedReferenceStore<RemoteNamedCache> {
        &self.store
    }

    pub fn start(&self) -> Result<()> {
        self.base.start()
    }

    /// Stop; cached proxies become inactive and die with the connection.
    pub fn stop(&self) {
        self.release_all(false);
        self.base.stop();
    }

    /// Close every cache channel, then the service itself.
    pub fn shutdown(&self) {
        self.release_all(true);
        self.base.shutdown();
    }

    /// Names of caches currently held by this service.
    pub fn cache_names(&self) -> Vec<String> {
        self.store.names()
    }

    /// Return the cache proxy for `name`, creating it remotely on first use.
    ///
    /// An empty name selects the default cache; `None` selects the calling
    /// thread's context scope.
    pub fn ensure_cache(&self, name: &str, scope: Option<&Scope>) -> Result<Arc<RemoteNamedCache>> {
        let name = normalize_name(name);
        let scope = Scope::resolve(scope)?;
        let subject = Subject::current();
        let key = StoreKey::new(
            name,
            scope,
            subject.clone().filter(|_| self.base.dependencies().subject_scoped),
        );

        let mut created = false;
        let cache = self.store.get_or_create(key.clone(), self.base.lock_wait(), || {
            let cache = self.create(name, key, subject)?;
            created = true;
            Ok(cache)
        })?;
        if created {
            self.base.emit(EventKind::Created, ResourceType::Cache, name);
        }
        Ok(cache)
    }

    fn create(
        &self,
        name: &str,
        key: StoreKey,
        subject: Option<Subject>,
    ) -> Result<Arc<RemoteNamedCache>> {
        let link = self.base.ensure_link()?;
        let request = link
            .channel
            .message_factory()
            .create_message(type_id::ENSURE_CACHE, vec![Value::from(name)])?;
        let reply = link.channel.request(request)?;
        let uri: ChannelUri = reply.expect_text("cache channel URI")?.parse()?;
        let channel = link
            .connection
            .accept_channel(&uri, None, subject.as_ref())?;
        log::debug!(
            "[CACHE] {}: bound cache '{}' to {} (channel {})",
            self.base.name(),
            name,
            uri,
            channel.id()
        );
        Ok(Arc::new(RemoteNamedCache {
            name: name.to_string(),
            key,
            service_id: self.base.id(),
            service: self.me.clone(),
            channel,
            active: AtomicBool::new(true),
        }))
    }

    /// Release the local proxy; the remote cache keeps its contents.
    pub fn release_cache(&self, cache: &Arc<RemoteNamedCache>) -> Result<()> {
        self.base.check_owner(cache.service_id, "cache", &cache.name)?;
        self.store.remove_if(&cache.key, cache);
        if cache.invalidate() {
            cache.close_channel();
            self.base.emit(EventKind::Released, ResourceType::Cache, &cache.name);
        }
        Ok(())
    }

    /// Destroy the remote cache and release the proxy.
    pub fn destroy_cache(&self, cache: &Arc<RemoteNamedCache>) -> Result<()> {
        self.base.check_owner(cache.service_id, "cache", &cache.name)?;
        self.store.remove_if(&cache.key, cache);
        cache.invalidate();

        let outcome = self.base.ensure_channel().and_then(|channel| {
            let request = channel
                .message_factory()
                .create_message(type_id::DESTROY_CACHE, vec![Value::from(cache.name.as_str())])?;
            channel.request(request)
        });
        // Closed on every path; the proxy is already out of the store.
        cache.close_channel();
        outcome?;

        log::debug!("[CACHE] {}: destroyed cache '{}'", self.base.name(), cache.name);
        self.base.emit(EventKind::Destroyed, ResourceType::Cache, &cache.name);
        Ok(())
    }

    /// Drain the store. With `close_channels` each channel is closed
    /// (failures ignored); otherwise proxies are only deactivated.
    fn release_all(&self, close_channels: bool) {
        let released = self.store.drain();
        if released.is_empty() {
            return;
        }
        log::debug!(
            "[CACHE] {}: releasing {} cache(s)",
            self.base.name(),
            released.len()
        );
        for cache in released {
            if cache.invalidate() && close_channels {
                cache.close_channel();
            }
            self.base.emit(EventKind::Released, ResourceType::Cache, &cache.name);
        }
    }
}

impl ConnectionListener for RemoteCacheService {
    fn connection_opened(&self, connection_id: u64) {
        self.base.connection_opened(connection_id);
    }

    fn connection_closed(&self, connection_id: u64) {
        if self.base.is_current_connection(connection_id) {
            self.release_all(true);
        }
        self.base.connection_closed(connection_id);
    }

    fn connection_error(&self, connection_id: u64, error: &Error) {
        if self.base.is_current_connection(connection_id) {
            self.release_all(true);
        }
        self.base.connection_error(connection_id, error);
    }
}

/// Local proxy for one remote cache. Keys and values are opaque bytes.
pub struct RemoteNamedCache {
    name: String,
    key: StoreKey,
    service_id: u64,
    service: Weak<RemoteCacheService>,
    channel: Arc<dyn Channel>,
    active: AtomicBool,
}

impl RemoteNamedCache {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &Scope {
        self.key.scope()
    }

    pub fn channel_id(&self) -> u32 {
        self.channel.id()
    }

    /// False once released, destroyed or cut off from the proxy.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.channel.is_open()
    }

    // ===== Data operations =====

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.request(Request::Get { key: key.to_vec() })?;
        optional_bytes(value, "cached value")
    }

    /// Store `value`, returning the previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let previous = self.request(Request::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        optional_bytes(previous, "previous value")
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let previous = self.request(Request::Remove { key: key.to_vec() })?;
        optional_bytes(previous, "removed value")
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let value = self.request(Request::ContainsKey { key: key.to_vec() })?;
        value
            .as_bool()
            .ok_or_else(|| Error::protocol(format!("contains_key reply must be bool, got {}", value.type_name())))
    }

    pub fn size(&self) -> Result<usize> {
        let size = self.request(Request::Size)?.expect_int("cache size")?;
        usize::try_from(size).map_err(|_| Error::protocol(format!("negative cache size {}", size)))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.request(Request::Clear).map(|_| ())
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.request(Request::Keys)?
            .expect_array("key set")?
            .iter()
            .map(|k| required_bytes(k, "key"))
            .collect()
    }

    /// Entries for the keys that are present.
    pub fn get_all(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let reply = self.request(Request::GetAll {
            keys: keys.to_vec(),
        })?;
        let mut entries = HashMap::new();
        for entry in reply.expect_array("entries")? {
            match entry.expect_array("entry")? {
                [k, v] => {
                    entries.insert(required_bytes(k, "entry key")?, required_bytes(v, "entry value")?);
                }
                other => {
                    return Err(Error::protocol(format!(
                        "entry must hold 2 fields, got {}",
                        other.len()
                    )))
                }
            }
        }
        Ok(entries)
    }

    // ===== Lifecycle =====

    /// Release through the owning service.
    pub fn release(self: &Arc<Self>) -> Result<()> {
        match self.service.upgrade() {
            Some(service) => service.release_cache(self),
            None => {
                if self.invalidate() {
                    self.close_channel();
                }
                Ok(())
            }
        }
    }

    /// Destroy through the owning service.
    pub fn destroy(self: &Arc<Self>) -> Result<()> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| Error::ServiceStopped(format!("owner of cache '{}'", self.name)))?;
        service.destroy_cache(self)
    }

    fn request(&self, request: Request) -> Result<Value> {
        if !self.is_active() {
            return Err(Error::InvalidState(format!(
                "cache '{}' has been released",
                self.name
            )));
        }
        self.channel.request(request)
    }

    /// Mark inactive. Returns false if it already was.
    fn invalidate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    fn close_channel(&self) {
        if let Err(e) = self.channel.close() {
            log::debug!("[CACHE] closing channel of cache '{}' failed: {}", self.name, e);
        }
    }
}

impl ScopedResource for RemoteNamedCache {
    fn is_active(&self) -> bool {
        RemoteNamedCache::is_active(self)
    }
}

impl fmt::Debug for RemoteNamedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNamedCache")
            .field("name", &self.name)
            .field("channel", &self.channel.id())
            .field("active", &self.is_active())
            .finish()
    }
}

fn optional_bytes(value: Value, what: &str) -> Result<Option<Vec<u8>>> {
    match value {
        Value::Null => Ok(None),
        Value::Bytes(bytes) => Ok(Some(bytes)),
        other => Err(Error::protocol(format!(
            "{} must be bytes, got {}",
            what,
            other.type_name()
        ))),
    }
}

fn required_bytes(value: &Value, what: &str) -> Result<Vec<u8>> {
    value
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::protocol(format!("{} must be bytes, got {}", what, value.type_name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InProcessInitiator;
    use crate::events::{EventFilter, ResourceEvent};
    use crate::server::InMemoryBackend;
    use parking_lot::Mutex;

    fn started() -> (Arc<RemoteCacheService>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let initiator = Arc::new(InProcessInitiator::new(backend.clone()));
        let service =
            RemoteCacheService::new(ServiceDependencies::default(), ServiceContext::new(initiator))
                .unwrap();
        service.start().unwrap();
        (service, backend)
    }

    #[test]
    fn test_data_operations() {
        let (service, backend) = started();
        let scope = Scope::new("app");
        let cache = service.ensure_cache("orders", Some(&scope)).unwrap();

        assert_eq!(cache.put(b"k1", b"v1").unwrap(), None);
        assert_eq!(cache.put(b"k1", b"v2").unwrap(), Some(b"v1".to_vec()));
        cache.put(b"k2", b"v3").unwrap();
        assert_eq!(cache.get(b"k1").unwrap(), Some(b"v2".to_vec()));
        assert!(cache.contains_key(b"k2").unwrap());
        assert_eq!(cache.size().unwrap(), 2);

        let all = cache.get_all(&[b"k1".to_vec(), b"missing".to_vec()]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get(b"k1".as_slice()), Some(&b"v2".to_vec()));

        assert_eq!(cache.remove(b"k2").unwrap(), Some(b"v3".to_vec()));
        assert_eq!(cache.keys().unwrap(), vec![b"k1".to_vec()]);
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
        assert_eq!(backend.cache_names(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_empty_name_is_default() {
        let (service, backend) = started();
        let scope = Scope::new("app");
        let cache = service.ensure_cache("", Some(&scope)).unwrap();
        assert_eq!(cache.name(), "Default");
        assert_eq!(backend.cache_names(), vec!["Default".to_string()]);
    }

    #[test]
    fn test_missing_context_scope() {
        let (service, _) = started();
        assert!(matches!(
            service.ensure_cache("orders", None),
            Err(Error::MissingContextScope)
        ));
        let scope = Scope::new("ctx");
        let _guard = scope.enter();
        let cache = service.ensure_cache("orders", None).unwrap();
        assert_eq!(cache.scope(), &scope);
    }

    #[test]
    fn test_release_keeps_remote_destroy_removes_it() {
        let (service, backend) = started();
        let scope = Scope::new("app");

        let cache = service.ensure_cache("orders", Some(&scope)).unwrap();
        cache.put(b"k", b"v").unwrap();
        cache.release().unwrap();
        assert!(!cache.is_active());
        assert!(matches!(cache.get(b"k"), Err(Error::InvalidState(_))));
        assert!(service.cache_names().is_empty());

        let again = service.ensure_cache("orders", Some(&scope)).unwrap();
        assert!(!Arc::ptr_eq(&cache, &again));
        assert_eq!(again.get(b"k").unwrap(), Some(b"v".to_vec()));

        again.destroy().unwrap();
        assert!(backend.cache_names().is_empty());
    }

    #[test]
    fn test_lifecycle_events() {
        let (service, _) = started();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.base().events().subscribe(
            EventFilter::all().resource(ResourceType::Cache),
            move |e: &ResourceEvent| sink.lock().push((e.kind, e.name.clone())),
        );

        let scope = Scope::new("app");
        let cache = service.ensure_cache("orders", Some(&scope)).unwrap();
        service.ensure_cache("orders", Some(&scope)).unwrap();
        service.destroy_cache(&cache).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (EventKind::Created, "orders".to_string()),
                (EventKind::Destroyed, "orders".to_string()),
            ]
        );
    }

    #[test]
    fn test_stop_deactivates_proxies() {
        let (service, _) = started();
        let scope = Scope::new("app");
        let cache = service.ensure_cache("orders", Some(&scope)).unwrap();
        service.stop();
        assert!(!cache.is_active());
        assert!(service.reference_store().is_empty());
        assert!(matches!(
            service.ensure_cache("orders", Some(&scope)),
            Err(Error::ServiceStopped(_))
        ));
    }
}
