// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote topic service, named-topic proxies, publishers and subscribers.
//!
//! A topic proxy listens on its channel for the proxy's destroy
//! notification; a topic destroyed by another client is dropped from the
//! store and reported as a `Destroyed` event. That event is dispatched on
//! the connection's reader thread.

use super::base::{normalize_name, RemoteService, ServiceContext};
use super::scope::{Scope, Subject};
use super::store::{ScopedReferenceStore, ScopedResource, StoreKey};
use crate::config::ServiceDependencies;
use crate::connection::{Channel, Connection, ConnectionListener, Receiver};
use crate::error::{Error, Result};
use crate::events::{EventKind, ResourceType};
use crate::protocol::{type_id, ChannelUri, Protocol, Request, Value};
use crate::server::TOPIC_DESTROYED;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Client for a proxy's topic service.
pub struct RemoteTopicService {
    base: RemoteService,
    store: ScopedReferenceStore<RemoteNamedTopic>,
    me: Weak<RemoteTopicService>,
}

impl RemoteTopicService {
    pub const DEFAULT_NAME: &'static str = "RemoteTopic";

    pub fn new(deps: ServiceDependencies, context: ServiceContext) -> Result<Arc<Self>> {
        Self::with_name(Self::DEFAULT_NAME, deps, context)
    }

    pub fn with_name(
        name: &str,
        deps: ServiceDependencies,
        context: ServiceContext,
    ) -> Result<Arc<Self>> {
        let base = RemoteService::new(name, Protocol::TopicService, deps, context)?;
        Ok(Arc::new_cyclic(move |weak: &Weak<Self>| Self {
            base: base.with_listener(weak.clone()),
            store: ScopedReferenceStore::new(),
            me: weak.clone(),
        }))
    }

    pub fn base(&self) -> &RemoteService {
        &self.base
    }

    pub fn reference_store(&self) -> &ScopedReferenceStore<RemoteNamedTopic> {
        &self.store
    }

    pub fn start(&self) -> Result<()> {
        self.base.start()
    }

    pub fn stop(&self) {
        self.release_all(false);
        self.base.stop();
    }

    pub fn shutdown(&self) {
        self.release_all(true);
        self.base.shutdown();
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.store.names()
    }

    /// Return the topic proxy for `name`, creating it remotely on first use.
    pub fn ensure_topic(&self, name: &str, scope: Option<&Scope>) -> Result<Arc<RemoteNamedTopic>> {
        let name = normalize_name(name);
        let scope = Scope::resolve(scope)?;
        let subject = Subject::current();
        let key = StoreKey::new(
            name,
            scope,
            subject.clone().filter(|_| self.base.dependencies().subject_scoped),
        );

        let mut created = false;
        let topic = self.store.get_or_create(key.clone(), self.base.lock_wait(), || {
            let topic = self.create(name, key, subject)?;
            created = true;
            Ok(topic)
        })?;
        if created {
            self.base.emit(EventKind::Created, ResourceType::Topic, name);
        }
        Ok(topic)
    }

    fn create(
        &self,
        name: &str,
        key: StoreKey,
        subject: Option<Subject>,
    ) -> Result<Arc<RemoteNamedTopic>> {
        let link = self.base.ensure_link()?;
        let request = link
            .channel
            .message_factory()
            .create_message(type_id::ENSURE_TOPIC, vec![Value::from(name)])?;
        let uri: ChannelUri = link
            .channel
            .request(request)?
            .expect_text("topic channel URI")?
            .parse()?;

        let receiver = Arc::new(TopicReceiver::new());
        let channel = link.connection.accept_channel(
            &uri,
            Some(receiver.clone() as Arc<dyn Receiver>),
            subject.as_ref(),
        )?;
        let topic = Arc::new(RemoteNamedTopic {
            name: name.to_string(),
            key,
            subject,
            service_id: self.base.id(),
            service: self.me.clone(),
            connection: link.connection,
            channel,
            active: AtomicBool::new(true),
        });
        if !receiver.bind(&topic) {
            topic.invalidate();
            topic.close_channel();
            return Err(Error::InvalidState(format!(
                "topic '{}' was destroyed while binding",
                name
            )));
        }
        log::debug!(
            "[TOPIC] {}: bound topic '{}' to {}",
            self.base.name(),
            name,
            uri
        );
        Ok(topic)
    }

    /// Release the local proxy; the remote topic survives.
    pub fn release_topic(&self, topic: &Arc<RemoteNamedTopic>) -> Result<()> {
        self.base.check_owner(topic.service_id, "topic", &topic.name)?;
        self.store.remove_if(&topic.key, topic);
        if topic.invalidate() {
            topic.close_channel();
            self.base.emit(EventKind::Released, ResourceType::Topic, &topic.name);
        }
        Ok(())
    }

    /// Destroy the remote topic and release the proxy.
    pub fn destroy_topic(&self, topic: &Arc<RemoteNamedTopic>) -> Result<()> {
        self.base.check_owner(topic.service_id, "topic", &topic.name)?;
        self.store.remove_if(&topic.key, topic);
        // Inactive first so our own destroy notification is ignored.
        topic.invalidate();

        let outcome = self.base.ensure_channel().and_then(|channel| {
            let request = channel
                .message_factory()
                .create_message(type_id::DESTROY_TOPIC, vec![Value::from(topic.name.as_str())])?;
            channel.request(request)
        });
        // Closed on every path; the proxy is already out of the store.
        topic.close_channel();
        outcome?;

        log::debug!("[TOPIC] {}: destroyed topic '{}'", self.base.name(), topic.name);
        self.base.emit(EventKind::Destroyed, ResourceType::Topic, &topic.name);
        Ok(())
    }

    /// The proxy reported `topic` destroyed by someone else.
    fn topic_destroyed(&self, topic: &Arc<RemoteNamedTopic>) {
        self.store.remove_if(&topic.key, topic);
        topic.close_channel();
        log::info!(
            "[TOPIC] {}: topic '{}' destroyed remotely",
            self.base.name(),
            topic.name
        );
        self.base.emit(EventKind::Destroyed, ResourceType::Topic, &topic.name);
    }

    fn release_all(&self, close_channels: bool) {
        let released = self.store.drain();
        if released.is_empty() {
            return;
        }
        log::debug!(
            "[TOPIC] {}: releasing {} topic(s)",
            self.base.name(),
            released.len()
        );
        for topic in released {
            if topic.invalidate() && close_channels {
                topic.close_channel();
            }
            self.base.emit(EventKind::Released, ResourceType::Topic, &topic.name);
        }
    }
}

impl ConnectionListener for RemoteTopicService {
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

/// Receives proxy notifications for one topic channel.
///
/// The channel is accepted before its proxy exists; a destroy notification
/// arriving in between is remembered and fails the bind.
struct TopicReceiver {
    binding: Mutex<Binding>,
}

enum Binding {
    Pending { destroyed: bool },
    Bound(Weak<RemoteNamedTopic>),
}

impl TopicReceiver {
    fn new() -> Self {
        Self {
            binding: Mutex::new(Binding::Pending { destroyed: false }),
        }
    }

    fn topic(&self) -> Option<Arc<RemoteNamedTopic>> {
        match &*self.binding.lock() {
            Binding::Bound(topic) => topic.upgrade(),
            Binding::Pending { .. } => None,
        }
    }

    /// Attach the proxy. False if the topic is already gone.
    fn bind(&self, topic: &Arc<RemoteNamedTopic>) -> bool {
        let mut binding = self.binding.lock();
        if let Binding::Pending { destroyed: true } = *binding {
            return false;
        }
        *binding = Binding::Bound(Arc::downgrade(topic));
        true
    }

    /// Record a destroy notification; returns the bound proxy, if any.
    fn mark_destroyed(&self) -> Option<Arc<RemoteNamedTopic>> {
        match &mut *self.binding.lock() {
            Binding::Pending { destroyed } => {
                *destroyed = true;
                None
            }
            Binding::Bound(topic) => topic.upgrade(),
        }
    }
}

impl Receiver for TopicReceiver {
    fn on_message(&self, channel_id: u32, message: Value) {
        match message.as_str() {
            Some(TOPIC_DESTROYED) => {
                if let Some(topic) = self.mark_destroyed() {
                    if topic.invalidate() {
                        if let Some(service) = topic.service.upgrade() {
                            service.topic_destroyed(&topic);
                        }
                    }
                }
            }
            _ => log::debug!(
                "[TOPIC] unexpected notification on channel {}: {}",
                channel_id,
                message
            ),
        }
    }

    fn on_channel_closed(&self, channel_id: u32) {
        if let Some(topic) = self.topic() {
            log::trace!("[TOPIC] channel {} of topic '{}' closed", channel_id, topic.name);
            topic.invalidate();
        }
    }
}

/// Local proxy for one remote topic.
pub struct RemoteNamedTopic {
    name: String,
    key: StoreKey,
    subject: Option<Subject>,
    service_id: u64,
    service: Weak<RemoteTopicService>,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    active: AtomicBool,
}

impl RemoteNamedTopic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &Scope {
        self.key.scope()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.channel.is_open()
    }

    pub fn channel_count(&self) -> Result<u32> {
        let count = self.request(Request::ChannelCount)?.expect_int("channel count")?;
        u32::try_from(count).map_err(|_| Error::protocol(format!("invalid channel count {}", count)))
    }

    pub fn subscriber_groups(&self) -> Result<Vec<String>> {
        self.request(Request::SubscriberGroups)?
            .expect_array("subscriber groups")?
            .iter()
            .map(|g| g.expect_text("subscriber group").map(String::from))
            .collect()
    }

    /// Create a publisher. `None` uses the topic's channel count.
    pub fn ensure_publisher(&self, channel_count: Option<u32>) -> Result<RemotePublisher> {
        let reply = self.request(Request::EnsurePublisher {
            channel_count: channel_count.unwrap_or(0),
        })?;
        let fields = reply.expect_array("publisher reply")?;
        let [uri, id, max_batch, channels] = fields else {
            return Err(Error::protocol(format!(
                "publisher reply must hold 4 fields, got {}",
                fields.len()
            )));
        };
        let uri: ChannelUri = uri.expect_text("publisher channel URI")?.parse()?;
        let id = id.expect_int("publisher id")?;
        let max_batch = max_batch.expect_int("max batch size")?;
        let channels = channels.expect_int("publisher channel count")?;

        let channel = self
            .connection
            .accept_channel(&uri, None, self.subject.as_ref())?;
        log::debug!(
            "[TOPIC] publisher {} on '{}' (batch {}, channels {})",
            id,
            self.name,
            max_batch,
            channels
        );
        Ok(RemotePublisher {
            id: u64::try_from(id).map_err(|_| Error::protocol(format!("invalid publisher id {}", id)))?,
            topic: self.name.clone(),
            max_batch_size: usize::try_from(max_batch.max(1)).unwrap_or(1),
            channel_count: u32::try_from(channels)
                .map_err(|_| Error::protocol(format!("invalid channel count {}", channels)))?,
            channel,
            batch: Mutex::new(Vec::new()),
        })
    }

    /// Create a subscriber, in `group` if given, else anonymous.
    pub fn ensure_subscriber(&self, group: Option<&str>) -> Result<RemoteSubscriber> {
        let uri: ChannelUri = self
            .request(Request::EnsureSubscriber {
                group: group.map(String::from),
            })?
            .expect_text("subscriber channel URI")?
            .parse()?;
        let channel = self
            .connection
            .accept_channel(&uri, None, self.subject.as_ref())?;
        Ok(RemoteSubscriber {
            topic: self.name.clone(),
            group: group.map(String::from),
            channel,
        })
    }

    pub fn release(self: &Arc<Self>) -> Result<()> {
        match self.service.upgrade() {
            Some(service) => service.release_topic(self),
            None => {
                if self.invalidate() {
                    self.close_channel();
                }
                Ok(())
            }
        }
    }

    pub fn destroy(self: &Arc<Self>) -> Result<()> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| Error::ServiceStopped(format!("owner of topic '{}'", self.name)))?;
        service.destroy_topic(self)
    }

    fn request(&self, request: Request) -> Result<Value> {
        if !self.is_active() {
            return Err(Error::InvalidState(format!(
                "topic '{}' is no longer active",
                self.name
            )));
        }
        self.channel.request(request)
    }

    fn invalidate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    fn close_channel(&self) {
        if let Err(e) = self.channel.close() {
            log::debug!("[TOPIC] closing channel of topic '{}' failed: {}", self.name, e);
        }
    }
}

impl ScopedResource for RemoteNamedTopic {
    fn is_active(&self) -> bool {
        RemoteNamedTopic::is_active(self)
    }
}

impl fmt::Debug for RemoteNamedTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNamedTopic")
            .field("name", &self.name)
            .field("channel", &self.channel.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Batching publisher.
///
/// Values accumulate until `max_batch_size` is reached or [`flush`] is
/// called.
///
/// [`flush`]: RemotePublisher::flush
pub struct RemotePublisher {
    id: u64,
    topic: String,
    max_batch_size: usize,
    channel_count: u32,
    channel: Arc<dyn Channel>,
    batch: Mutex<Vec<Vec<u8>>>,
}

impl RemotePublisher {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    /// Values waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.batch.lock().len()
    }

    /// Queue `value`; a full batch is sent immediately.
    pub fn publish(&self, value: Vec<u8>) -> Result<()> {
        let full = {
            let mut batch = self.batch.lock();
            batch.push(value);
            batch.len() >= self.max_batch_size
        };
        if full {
            self.flush()?;
        }
        Ok(())
    }

    /// Send queued values. Returns how many the proxy accepted.
    pub fn flush(&self) -> Result<usize> {
        let values = std::mem::take(&mut *self.batch.lock());
        if values.is_empty() {
            return Ok(0);
        }
        let count = values.len();
        let accepted = self
            .channel
            .request(Request::Publish { values })?
            .expect_int("published count")?;
        log::trace!("[TOPIC] publisher {} flushed {} value(s)", self.id, count);
        usize::try_from(accepted)
            .map_err(|_| Error::protocol(format!("invalid published count {}", accepted)))
    }

    /// Flush and close the channel.
    pub fn close(&self) -> Result<()> {
        let flushed = if self.channel.is_open() {
            self.flush().map(|_| ())
        } else {
            Ok(())
        };
        if let Err(e) = self.channel.close() {
            log::debug!("[TOPIC] closing publisher {} failed: {}", self.id, e);
        }
        flushed
    }
}

/// Topic subscriber.
pub struct RemoteSubscriber {
    topic: String,
    group: Option<String>,
    channel: Arc<dyn Channel>,
}

impl RemoteSubscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Take up to `max` values; empty when nothing is waiting.
    pub fn receive(&self, max: u32) -> Result<Vec<Vec<u8>>> {
        self.channel
            .request(Request::Receive { max })?
            .expect_array("received values")?
            .iter()
            .map(|v| {
                v.as_bytes().map(<[u8]>::to_vec).ok_or_else(|| {
                    Error::protocol(format!("received value must be bytes, got {}", v.type_name()))
                })
            })
            .collect()
    }

    pub fn close(&self) -> Result<()> {
        self.channel.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InProcessInitiator;
    use crate::events::{EventFilter, ResourceEvent};
    use crate::server::InMemoryBackend;

    fn started(backend: &Arc<InMemoryBackend>) -> Arc<RemoteTopicService> {
        let initiator = Arc::new(InProcessInitiator::new(backend.clone()));
        let service =
            RemoteTopicService::new(ServiceDependencies::default(), ServiceContext::new(initiator))
                .unwrap();
        service.start().unwrap();
        service
    }

    #[test]
    fn test_publish_and_receive() {
        let backend = Arc::new(InMemoryBackend::new().with_max_batch_size(2));
        let service = started(&backend);
        let scope = Scope::new("app");
        let topic = service.ensure_topic("prices", Some(&scope)).unwrap();

        let subscriber = topic.ensure_subscriber(Some("audit")).unwrap();
        let publisher = topic.ensure_publisher(None).unwrap();
        assert_eq!(publisher.max_batch_size(), 2);
        assert_eq!(publisher.channel_count(), InMemoryBackend::DEFAULT_CHANNEL_COUNT);
        assert_eq!(topic.channel_count().unwrap(), InMemoryBackend::DEFAULT_CHANNEL_COUNT);
        assert_eq!(topic.subscriber_groups().unwrap(), vec!["audit".to_string()]);

        publisher.publish(b"a".to_vec()).unwrap();
        assert_eq!(publisher.pending(), 1);
        publisher.publish(b"b".to_vec()).unwrap();
        assert_eq!(publisher.pending(), 0);
        publisher.publish(b"c".to_vec()).unwrap();
        publisher.close().unwrap();

        assert_eq!(
            subscriber.receive(10).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert!(subscriber.receive(10).unwrap().is_empty());
        subscriber.close().unwrap();
    }

    #[test]
    fn test_destroy_notifies_other_proxies() {
        let backend = Arc::new(InMemoryBackend::new());
        let service = started(&backend);
        let first = Scope::new("first");
        let second = Scope::new("second");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        service.base().events().subscribe(
            EventFilter::all().kind(EventKind::Destroyed),
            move |e: &ResourceEvent| sink.lock().push(e.name.clone()),
        );

        let watched = service.ensure_topic("news", Some(&first)).unwrap();
        let doomed = service.ensure_topic("news", Some(&second)).unwrap();
        assert!(!Arc::ptr_eq(&watched, &doomed));
        service.destroy_topic(&doomed).unwrap();

        assert!(!watched.is_active());
        assert!(service.reference_store().is_empty());
        assert_eq!(*events.lock(), vec!["news".to_string(), "news".to_string()]);
        assert!(backend.topic_names().is_empty());
    }

    #[test]
    fn test_destroy_before_bind_fails_the_bind() {
        let backend = Arc::new(InMemoryBackend::new());
        let service = started(&backend);
        let topic = service.ensure_topic("late", Some(&Scope::new("app"))).unwrap();

        let receiver = TopicReceiver::new();
        receiver.on_message(7, Value::from(TOPIC_DESTROYED));
        assert!(!receiver.bind(&topic));
        assert!(receiver.topic().is_none());

        let fresh = TopicReceiver::new();
        assert!(fresh.bind(&topic));
        assert!(Arc::ptr_eq(&fresh.mark_destroyed().unwrap(), &topic));
    }

    #[test]
    fn test_release_is_owner_checked() {
        let backend = Arc::new(InMemoryBackend::new());
        let a = started(&backend);
        let b = started(&backend);
        let scope = Scope::new("app");
        let topic = a.ensure_topic("t", Some(&scope)).unwrap();

        assert!(matches!(
            b.release_topic(&topic),
            Err(Error::IllegalResource { kind: "topic", .. })
        ));
        assert!(topic.is_active());
        topic.release().unwrap();
        assert!(!topic.is_active());
        assert_eq!(backend.topic_names(), vec!["t".to_string()]);
    }
}
