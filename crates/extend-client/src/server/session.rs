// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection proxy state: the channel table.
//!
//! Channel ids are allocated per session starting at 1 (0 is the control
//! channel). A `Bind` reply parks the new channel as pending until the
//! client accepts its URI.

use super::backend::{HandlerReply, ProxyBackend, SessionEffect, Target, TOPIC_DESTROYED};
use crate::error::{Error, Result};
use crate::protocol::{ChannelUri, MessageFactory, Protocol, Request, Response, Value};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Callback delivering a pushed message to the client side of a channel.
pub type NotifySink = Box<dyn Fn(u32, Value) + Send + Sync>;

struct SessionChannel {
    target: Target,
    subject: Option<String>,
}

/// Proxy-side view of one client connection.
pub struct ProxySession {
    backend: Arc<dyn ProxyBackend>,
    channels: DashMap<u32, SessionChannel>,
    pending: DashMap<u32, Target>,
    next_id: AtomicU32,
    notify: NotifySink,
}

impl ProxySession {
    pub fn new(backend: Arc<dyn ProxyBackend>, notify: NotifySink) -> Self {
        Self {
            backend,
            channels: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU32::new(1),
            notify,
        }
    }

    fn allocate(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a service-level channel.
    pub fn open_channel(&self, protocol: Protocol, subject: Option<String>) -> Result<u32> {
        match protocol {
            Protocol::CacheService
            | Protocol::TopicService
            | Protocol::InvocationService
            | Protocol::NameService => {}
            other => {
                return Err(Error::protocol(format!(
                    "{} channels are created by the proxy, not opened",
                    other
                )))
            }
        }
        let id = self.allocate();
        self.channels.insert(
            id,
            SessionChannel {
                target: Target::Service(protocol),
                subject,
            },
        );
        log::debug!("[PROXY] opened {} channel {}", protocol, id);
        Ok(id)
    }

    /// Bind a pending channel to the client.
    pub fn accept_channel(&self, uri: &ChannelUri, subject: Option<String>) -> Result<u32> {
        let (id, target) = self
            .pending
            .remove(&uri.id)
            .ok_or_else(|| Error::transport(format!("no pending channel for '{}'", uri)))?;
        if target.protocol() != uri.protocol {
            return Err(Error::transport(format!(
                "channel URI '{}' names protocol {}, channel is {}",
                uri,
                uri.protocol,
                target.protocol()
            )));
        }
        self.channels.insert(id, SessionChannel { target, subject });
        Ok(id)
    }

    /// Handle a request on `channel_id`.
    pub fn handle(&self, channel_id: u32, request: Request) -> Response {
        self.dispatch(channel_id, request).into()
    }

    fn dispatch(&self, channel_id: u32, request: Request) -> Result<Value> {
        let (target, subject) = {
            let channel = self
                .channels
                .get(&channel_id)
                .ok_or_else(|| Error::InvalidState(format!("channel {} is not open", channel_id)))?;
            (channel.target.clone(), channel.subject.clone())
        };
        if !MessageFactory::new(target.protocol()).accepts(&request) {
            return Err(Error::protocol(format!(
                "{} request sent on {} channel {}",
                request.protocol(),
                target.protocol(),
                channel_id
            )));
        }

        let (reply, effect) = self.backend.handle(&target, request, subject.as_deref())?;
        if let Some(effect) = effect {
            self.apply(effect);
        }

        match reply {
            HandlerReply::Value(value) => Ok(value),
            HandlerReply::Bind { target, extra } => {
                let id = self.allocate();
                let uri = ChannelUri::new(id, target.protocol());
                self.pending.insert(id, target);
                let uri = Value::from(uri.to_string());
                if extra.is_empty() {
                    Ok(uri)
                } else {
                    let mut fields = Vec::with_capacity(extra.len() + 1);
                    fields.push(uri);
                    fields.extend(extra);
                    Ok(Value::Array(fields))
                }
            }
        }
    }

    fn apply(&self, effect: SessionEffect) {
        match effect {
            SessionEffect::TopicDestroyed(name) => {
                let bound: Vec<u32> = self
                    .channels
                    .iter()
                    .filter(|c| matches!(&c.target, Target::Topic(t) if *t == name))
                    .map(|c| *c.key())
                    .collect();
                for id in bound {
                    (self.notify)(id, Value::from(TOPIC_DESTROYED));
                }
            }
        }
    }

    /// Close a channel. Unknown ids are ignored.
    pub fn close_channel(&self, channel_id: u32) {
        if let Some((_, channel)) = self.channels.remove(&channel_id) {
            self.backend.channel_closed(&channel.target);
            log::trace!("[PROXY] closed channel {}", channel_id);
        }
    }

    /// Close every channel (connection gone).
    pub fn close_all(&self) {
        let ids: Vec<u32> = self.channels.iter().map(|c| *c.key()).collect();
        for id in ids {
            self.close_channel(id);
        }
        self.pending.clear();
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::InMemoryBackend;
    use parking_lot::Mutex;

    fn session() -> (ProxySession, Arc<Mutex<Vec<(u32, Value)>>>) {
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pushed);
        let session = ProxySession::new(
            Arc::new(InMemoryBackend::new()),
            Box::new(move |id, v| sink.lock().push((id, v))),
        );
        (session, pushed)
    }

    #[test]
    fn test_bind_then_accept() {
        let (session, _) = session();
        let svc = session.open_channel(Protocol::CacheService, None).unwrap();
        let uri = session
            .handle(svc, Request::EnsureCache { name: "c".into() })
            .into_result()
            .unwrap();
        let uri: ChannelUri = uri.as_str().unwrap().parse().unwrap();
        assert_eq!(uri.protocol, Protocol::NamedCache);

        let id = session.accept_channel(&uri, None).unwrap();
        assert_eq!(id, uri.id);
        assert_eq!(
            session.handle(id, Request::Size).into_result().unwrap(),
            Value::Int(0)
        );
        // a URI can be accepted once
        assert!(session.accept_channel(&uri, None).is_err());
    }

    #[test]
    fn test_foreign_request_rejected() {
        let (session, _) = session();
        let svc = session.open_channel(Protocol::NameService, None).unwrap();
        let response = session.handle(svc, Request::Size);
        assert!(matches!(response, Response::Failure { .. }));
        assert!(session.open_channel(Protocol::NamedCache, None).is_err());
    }

    #[test]
    fn test_topic_destroy_notifies_bound_channels() {
        let (session, pushed) = session();
        let svc = session.open_channel(Protocol::TopicService, None).unwrap();
        let uri = session
            .handle(svc, Request::EnsureTopic { name: "t".into() })
            .into_result()
            .unwrap();
        let topic = session
            .accept_channel(&uri.as_str().unwrap().parse().unwrap(), None)
            .unwrap();
        session
            .handle(svc, Request::DestroyTopic { name: "t".into() })
            .into_result()
            .unwrap();
        assert_eq!(*pushed.lock(), vec![(topic, Value::from(TOPIC_DESTROYED))]);
    }
}
