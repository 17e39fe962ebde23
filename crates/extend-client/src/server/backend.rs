// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy-side request handling.
//!
//! A [`ProxyBackend`] answers requests addressed to a channel [`Target`].
//! Resource-creation requests answer with [`HandlerReply::Bind`]; the session
//! turns that into a pending channel plus the URI the client accepts.
//!
//! [`InMemoryBackend`] keeps caches, topics, invocables and name bindings in
//! process memory. It backs `extendctl serve` and the test suites.

use crate::error::{Error, Result};
use crate::protocol::{failure_code, Protocol, Request, Value};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// What a channel is bound to on the proxy side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Service(Protocol),
    Cache(String),
    Topic(String),
    Publisher { topic: String, id: u64 },
    Subscriber { topic: String, id: u64 },
}

impl Target {
    pub fn protocol(&self) -> Protocol {
        match self {
            Target::Service(p) => *p,
            Target::Cache(_) => Protocol::NamedCache,
            Target::Topic(_) => Protocol::NamedTopic,
            Target::Publisher { .. } => Protocol::Publisher,
            Target::Subscriber { .. } => Protocol::Subscriber,
        }
    }
}

/// Result of handling one request.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    /// Plain result.
    Value(Value),
    /// Create a channel bound to `target`. The client receives the channel
    /// URI, or `[uri, extra...]` when `extra` is non-empty.
    Bind { target: Target, extra: Vec<Value> },
}

/// Side effects a handled request asks the session to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Notify every channel bound to this topic that it was destroyed.
    TopicDestroyed(String),
}

/// Message pushed on a topic channel after the topic was destroyed.
pub const TOPIC_DESTROYED: &str = "destroyed";

/// Proxy-side request handler.
pub trait ProxyBackend: Send + Sync {
    /// Handle `request` sent on a channel bound to `target`.
    fn handle(
        &self,
        target: &Target,
        request: Request,
        subject: Option<&str>,
    ) -> Result<(HandlerReply, Option<SessionEffect>)>;

    /// A channel bound to `target` was closed.
    fn channel_closed(&self, _target: &Target) {}
}

/// Server-side task run by `InvocationService::Query`.
pub type Invocable = Arc<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>;

type CacheMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Topic state: subscriber queues plus the publisher id sequence.
struct TopicState {
    channel_count: u32,
    destroyed: AtomicBool,
    next_endpoint: AtomicU64,
    /// Group name -> shared queue.
    groups: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    /// Anonymous subscriber id -> private queue.
    anonymous: Mutex<HashMap<u64, VecDeque<Vec<u8>>>>,
    /// Subscriber id -> group (anonymous subscribers are absent).
    membership: Mutex<HashMap<u64, String>>,
}

impl TopicState {
    fn new(channel_count: u32) -> Self {
        Self {
            channel_count,
            destroyed: AtomicBool::new(false),
            next_endpoint: AtomicU64::new(1),
            groups: Mutex::new(HashMap::new()),
            anonymous: Mutex::new(HashMap::new()),
            membership: Mutex::new(HashMap::new()),
        }
    }
}

/// In-memory proxy backend.
pub struct InMemoryBackend {
    caches: DashMap<String, Arc<RwLock<CacheMap>>>,
    topics: DashMap<String, Arc<TopicState>>,
    invocables: DashMap<String, Invocable>,
    names: DashMap<String, Value>,
    channel_count: u32,
    max_batch_size: u32,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub const DEFAULT_CHANNEL_COUNT: u32 = 17;
    pub const DEFAULT_MAX_BATCH_SIZE: u32 = 64;

    pub fn new() -> Self {
        Self {
            caches: DashMap::new(),
            topics: DashMap::new(),
            invocables: DashMap::new(),
            names: DashMap::new(),
            channel_count: Self::DEFAULT_CHANNEL_COUNT,
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Builder: values per `Publish` request a publisher may send.
    pub fn with_max_batch_size(mut self, max: u32) -> Self {
        self.max_batch_size = max.max(1);
        self
    }

    /// Register a task runnable through the invocation service.
    pub fn register_invocable<F>(&self, name: impl Into<String>, task: F)
    where
        F: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        self.invocables.insert(name.into(), Arc::new(task));
    }

    /// Bind a name-service entry.
    pub fn bind_name(&self, name: impl Into<String>, value: Value) {
        self.names.insert(name.into(), value);
    }

    /// Publish the `[host, port]` address of a proxy service.
    pub fn bind_proxy_address(&self, service: impl Into<String>, addr: std::net::SocketAddr) {
        self.bind_name(
            service,
            Value::Array(vec![
                Value::from(addr.ip().to_string()),
                Value::from(u32::from(addr.port())),
            ]),
        );
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn cache(&self, name: &str) -> Result<Arc<RwLock<CacheMap>>> {
        self.caches
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| not_found("cache", name))
    }

    fn topic(&self, name: &str) -> Result<Arc<TopicState>> {
        self.topics
            .get(name)
            .map(|t| Arc::clone(t.value()))
            .filter(|t| !t.destroyed.load(Ordering::Acquire))
            .ok_or_else(|| not_found("topic", name))
    }

    // ===== Per-protocol handlers =====

    fn handle_service(&self, protocol: Protocol, request: Request) -> Result<(HandlerReply, Option<SessionEffect>)> {
        let reply = match request {
            Request::EnsureCache { name } => {
                self.caches
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(RwLock::new(CacheMap::new())));
                log::debug!("[PROXY] ensured cache '{}'", name);
                bind(Target::Cache(name))
            }
            Request::DestroyCache { name } => {
                let existed = self.caches.remove(&name).is_some();
                log::debug!("[PROXY] destroyed cache '{}' (existed: {})", name, existed);
                HandlerReply::Value(Value::Bool(existed))
            }
            Request::EnsureTopic { name } => {
                let fresh = self
                    .topics
                    .get(&name)
                    .map(|t| t.destroyed.load(Ordering::Acquire))
                    .unwrap_or(true);
                if fresh {
                    self.topics
                        .insert(name.clone(), Arc::new(TopicState::new(self.channel_count)));
                }
                log::debug!("[PROXY] ensured topic '{}'", name);
                bind(Target::Topic(name))
            }
            Request::DestroyTopic { name } => {
                let removed = self.topics.remove(&name);
                if let Some((_, topic)) = &removed {
                    topic.destroyed.store(true, Ordering::Release);
                }
                log::debug!("[PROXY] destroyed topic '{}'", name);
                return Ok((
                    HandlerReply::Value(Value::Bool(removed.is_some())),
                    Some(SessionEffect::TopicDestroyed(name)),
                ));
            }
            Request::Query { task, payload } => {
                let invocable = self
                    .invocables
                    .get(&task)
                    .map(|t| Arc::clone(t.value()))
                    .ok_or_else(|| not_found("invocable", &task))?;
                HandlerReply::Value(invocable(&payload)?)
            }
            Request::Lookup { name } => {
                HandlerReply::Value(self.names.get(&name).map(|v| v.value().clone()).unwrap_or_default())
            }
            other => return Err(wrong_target(&Target::Service(protocol), &other)),
        };
        Ok((reply, None))
    }

    fn handle_cache(&self, name: &str, request: Request) -> Result<HandlerReply> {
        let cache = self.cache(name)?;
        let value = match request {
            Request::Size => Value::from(cache.read().len()),
            Request::ContainsKey { key } => Value::Bool(cache.read().contains_key(&key)),
            Request::Get { key } => Value::from(cache.read().get(&key).cloned()),
            Request::Put { key, value } => Value::from(cache.write().insert(key, value)),
            Request::Remove { key } => Value::from(cache.write().remove(&key)),
            Request::Clear => {
                cache.write().clear();
                Value::Null
            }
            Request::Keys => Value::Array(cache.read().keys().cloned().map(Value::Bytes).collect()),
            Request::GetAll { keys } => {
                let map = cache.read();
                Value::Array(
                    keys.into_iter()
                        .filter_map(|k| {
                            map.get(&k)
                                .map(|v| Value::Array(vec![Value::Bytes(k.clone()), Value::Bytes(v.clone())]))
                        })
                        .collect(),
                )
            }
            other => return Err(wrong_target(&Target::Cache(name.to_string()), &other)),
        };
        Ok(HandlerReply::Value(value))
    }

    fn handle_topic(&self, name: &str, request: Request) -> Result<HandlerReply> {
        let topic = self.topic(name)?;
        let reply = match request {
            Request::ChannelCount => HandlerReply::Value(Value::from(topic.channel_count)),
            Request::SubscriberGroups => {
                let mut groups: Vec<String> = topic.groups.lock().keys().cloned().collect();
                groups.sort();
                HandlerReply::Value(Value::Array(groups.into_iter().map(Value::from).collect()))
            }
            Request::EnsurePublisher { channel_count } => {
                let id = topic.next_endpoint.fetch_add(1, Ordering::Relaxed);
                let count = if channel_count == 0 {
                    topic.channel_count
                } else {
                    channel_count
                };
                HandlerReply::Bind {
                    target: Target::Publisher {
                        topic: name.to_string(),
                        id,
                    },
                    extra: vec![
                        Value::from(id as i64),
                        Value::from(self.max_batch_size),
                        Value::from(count),
                    ],
                }
            }
            Request::EnsureSubscriber { group } => {
                let id = topic.next_endpoint.fetch_add(1, Ordering::Relaxed);
                match group {
                    Some(group) => {
                        topic.groups.lock().entry(group.clone()).or_default();
                        topic.membership.lock().insert(id, group);
                    }
                    None => {
                        topic.anonymous.lock().insert(id, VecDeque::new());
                    }
                }
                bind(Target::Subscriber {
                    topic: name.to_string(),
                    id,
                })
            }
            other => return Err(wrong_target(&Target::Topic(name.to_string()), &other)),
        };
        Ok(reply)
    }

    fn publish(&self, topic_name: &str, values: Vec<Vec<u8>>) -> Result<Value> {
        let topic = self.topic(topic_name)?;
        if values.len() > self.max_batch_size as usize {
            return Err(Error::IllegalArgument(format!(
                "batch of {} exceeds maximum {}",
                values.len(),
                self.max_batch_size
            )));
        }
        for queue in topic.groups.lock().values_mut() {
            queue.extend(values.iter().cloned());
        }
        for queue in topic.anonymous.lock().values_mut() {
            queue.extend(values.iter().cloned());
        }
        Ok(Value::from(values.len()))
    }

    fn receive(&self, topic_name: &str, subscriber: u64, max: u32) -> Result<Value> {
        let topic = self.topic(topic_name)?;
        let group = topic.membership.lock().get(&subscriber).cloned();
        let take = |queue: &mut VecDeque<Vec<u8>>| {
            let n = queue.len().min(max as usize);
            queue.drain(..n).map(Value::Bytes).collect::<Vec<_>>()
        };
        let values = match group {
            Some(group) => topic.groups.lock().get_mut(&group).map(take),
            None => topic.anonymous.lock().get_mut(&subscriber).map(take),
        }
        .ok_or_else(|| not_found("subscriber", &subscriber.to_string()))?;
        Ok(Value::Array(values))
    }
}

impl ProxyBackend for InMemoryBackend {
    fn handle(
        &self,
        target: &Target,
        request: Request,
        subject: Option<&str>,
    ) -> Result<(HandlerReply, Option<SessionEffect>)> {
        log::trace!(
            "[PROXY] {} on {:?} (subject: {})",
            request.operation(),
            target,
            subject.unwrap_or("-")
        );
        match target {
            Target::Service(protocol) => self.handle_service(*protocol, request),
            Target::Cache(name) => self.handle_cache(name, request).map(|r| (r, None)),
            Target::Topic(name) => self.handle_topic(name, request).map(|r| (r, None)),
            Target::Publisher { topic, .. } => match request {
                Request::Publish { values } => Ok((HandlerReply::Value(self.publish(topic, values)?), None)),
                other => Err(wrong_target(target, &other)),
            },
            Target::Subscriber { topic, id } => match request {
                Request::Receive { max } => Ok((HandlerReply::Value(self.receive(topic, *id, max)?), None)),
                other => Err(wrong_target(target, &other)),
            },
        }
    }

    fn channel_closed(&self, target: &Target) {
        if let Target::Subscriber { topic, id } = target {
            if let Some(topic) = self.topics.get(topic) {
                topic.anonymous.lock().remove(id);
                topic.membership.lock().remove(id);
            }
        }
    }
}

fn bind(target: Target) -> HandlerReply {
    HandlerReply::Bind {
        target,
        extra: Vec::new(),
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::Remote {
        code: failure_code::NOT_FOUND,
        message: format!("{} '{}' does not exist", kind, name),
    }
}

fn wrong_target(target: &Target, request: &Request) -> Error {
    Error::protocol(format!(
        "request {} not valid on a channel bound to {:?}",
        request.operation(),
        target
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(p: Protocol) -> Target {
        Target::Service(p)
    }

    fn value(reply: (HandlerReply, Option<SessionEffect>)) -> Value {
        match reply.0 {
            HandlerReply::Value(v) => v,
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn test_ensure_cache_binds_and_data_ops_work() {
        let backend = InMemoryBackend::new();
        let (reply, _) = backend
            .handle(
                &service(Protocol::CacheService),
                Request::EnsureCache {
                    name: "orders".into(),
                },
                None,
            )
            .unwrap();
        assert_eq!(
            reply,
            HandlerReply::Bind {
                target: Target::Cache("orders".into()),
                extra: vec![]
            }
        );

        let cache = Target::Cache("orders".into());
        let put = |k: &[u8], v: &[u8]| {
            value(
                backend
                    .handle(
                        &cache,
                        Request::Put {
                            key: k.to_vec(),
                            value: v.to_vec(),
                        },
                        None,
                    )
                    .unwrap(),
            )
        };
        assert_eq!(put(b"a", b"1"), Value::Null);
        assert_eq!(put(b"a", b"2"), Value::Bytes(b"1".to_vec()));
        assert_eq!(
            value(backend.handle(&cache, Request::Size, None).unwrap()),
            Value::Int(1)
        );
    }

    #[test]
    fn test_group_subscribers_share_a_queue() {
        let backend = InMemoryBackend::new();
        backend
            .handle(
                &service(Protocol::TopicService),
                Request::EnsureTopic { name: "t".into() },
                None,
            )
            .unwrap();
        let topic = Target::Topic("t".into());
        let subscribe = |group: Option<&str>| match backend
            .handle(
                &topic,
                Request::EnsureSubscriber {
                    group: group.map(String::from),
                },
                None,
            )
            .unwrap()
            .0
        {
            HandlerReply::Bind { target, .. } => target,
            other => panic!("unexpected {:?}", other),
        };
        let g1 = subscribe(Some("g"));
        let g2 = subscribe(Some("g"));
        let anon = subscribe(None);

        let publisher = Target::Publisher {
            topic: "t".into(),
            id: 99,
        };
        backend
            .handle(
                &publisher,
                Request::Publish {
                    values: vec![b"x".to_vec(), b"y".to_vec()],
                },
                None,
            )
            .unwrap();

        let receive = |target: &Target| value(backend.handle(target, Request::Receive { max: 10 }, None).unwrap());
        assert_eq!(receive(&g1).as_array().unwrap().len(), 2);
        assert_eq!(receive(&g2).as_array().unwrap().len(), 0);
        assert_eq!(receive(&anon).as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_destroy_topic_requests_notification() {
        let backend = InMemoryBackend::new();
        let topic_service = service(Protocol::TopicService);
        backend
            .handle(&topic_service, Request::EnsureTopic { name: "t".into() }, None)
            .unwrap();
        let (_, effect) = backend
            .handle(&topic_service, Request::DestroyTopic { name: "t".into() }, None)
            .unwrap();
        assert_eq!(effect, Some(SessionEffect::TopicDestroyed("t".into())));
        assert!(backend
            .handle(&Target::Topic("t".into()), Request::ChannelCount, None)
            .is_err());
    }

    #[test]
    fn test_unknown_invocable_is_not_found() {
        let backend = InMemoryBackend::new();
        backend.register_invocable("echo", |payload| Ok(Value::Bytes(payload.to_vec())));
        let target = service(Protocol::InvocationService);
        let ok = backend
            .handle(
                &target,
                Request::Query {
                    task: "echo".into(),
                    payload: b"hi".to_vec(),
                },
                None,
            )
            .unwrap();
        assert_eq!(value(ok), Value::Bytes(b"hi".to_vec()));

        let err = backend
            .handle(
                &target,
                Request::Query {
                    task: "missing".into(),
                    payload: vec![],
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Remote { code: failure_code::NOT_FOUND, .. }));
    }
}
