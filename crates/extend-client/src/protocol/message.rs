// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed requests keyed by `(protocol, type id)`.
//!
//! Every channel is bound to one [`Protocol`]. Its [`MessageFactory`] builds
//! requests from a type id plus positional arguments and refuses type ids
//! that belong to another protocol. The same factory decodes requests on the
//! proxy side, so the wire form of a request is just
//! `u8 protocol | u16 type id | Value::Array(args)`.

use super::value::{Value, WireReader};
use crate::error::{Error, Result};
use std::fmt;

/// Message protocol a channel is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    CacheService,
    NamedCache,
    TopicService,
    NamedTopic,
    Publisher,
    Subscriber,
    InvocationService,
    NameService,
}

impl Protocol {
    pub const ALL: [Protocol; 8] = [
        Protocol::CacheService,
        Protocol::NamedCache,
        Protocol::TopicService,
        Protocol::NamedTopic,
        Protocol::Publisher,
        Protocol::Subscriber,
        Protocol::InvocationService,
        Protocol::NameService,
    ];

    pub fn id(self) -> u8 {
        match self {
            Protocol::CacheService => 1,
            Protocol::NamedCache => 2,
            Protocol::TopicService => 3,
            Protocol::NamedTopic => 4,
            Protocol::Publisher => 5,
            Protocol::Subscriber => 6,
            Protocol::InvocationService => 7,
            Protocol::NameService => 8,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.id() == id)
            .ok_or_else(|| Error::protocol(format!("unknown protocol id {}", id)))
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::CacheService => "CacheService",
            Protocol::NamedCache => "NamedCache",
            Protocol::TopicService => "TopicService",
            Protocol::NamedTopic => "NamedTopic",
            Protocol::Publisher => "Publisher",
            Protocol::Subscriber => "Subscriber",
            Protocol::InvocationService => "InvocationService",
            Protocol::NameService => "NameService",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::protocol(format!("unknown protocol '{}'", name)))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type ids, unique within their protocol.
pub mod type_id {
    // CacheService
    pub const ENSURE_CACHE: u16 = 1;
    pub const DESTROY_CACHE: u16 = 2;

    // NamedCache
    pub const SIZE: u16 = 1;
    pub const CONTAINS_KEY: u16 = 2;
    pub const GET: u16 = 3;
    pub const PUT: u16 = 4;
    pub const REMOVE: u16 = 5;
    pub const CLEAR: u16 = 6;
    pub const KEYS: u16 = 7;
    pub const GET_ALL: u16 = 8;

    // TopicService
    pub const ENSURE_TOPIC: u16 = 1;
    pub const DESTROY_TOPIC: u16 = 2;

    // NamedTopic
    pub const ENSURE_PUBLISHER: u16 = 1;
    pub const ENSURE_SUBSCRIBER: u16 = 2;
    pub const CHANNEL_COUNT: u16 = 3;
    pub const SUBSCRIBER_GROUPS: u16 = 4;

    // Publisher
    pub const PUBLISH: u16 = 1;

    // Subscriber
    pub const RECEIVE: u16 = 1;

    // InvocationService
    pub const QUERY: u16 = 1;

    // NameService
    pub const LOOKUP: u16 = 1;
}

/// A typed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    // CacheService
    EnsureCache { name: String },
    DestroyCache { name: String },

    // NamedCache
    Size,
    ContainsKey { key: Vec<u8> },
    Get { key: Vec<u8> },
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    Clear,
    Keys,
    GetAll { keys: Vec<Vec<u8>> },

    // TopicService
    EnsureTopic { name: String },
    DestroyTopic { name: String },

    // NamedTopic
    EnsurePublisher { channel_count: u32 },
    EnsureSubscriber { group: Option<String> },
    ChannelCount,
    SubscriberGroups,

    // Publisher
    Publish { values: Vec<Vec<u8>> },

    // Subscriber
    Receive { max: u32 },

    // InvocationService
    Query { task: String, payload: Vec<u8> },

    // NameService
    Lookup { name: String },
}

impl Request {
    pub fn protocol(&self) -> Protocol {
        match self {
            Request::EnsureCache { .. } | Request::DestroyCache { .. } => Protocol::CacheService,
            Request::Size
            | Request::ContainsKey { .. }
            | Request::Get { .. }
            | Request::Put { .. }
            | Request::Remove { .. }
            | Request::Clear
            | Request::Keys
            | Request::GetAll { .. } => Protocol::NamedCache,
            Request::EnsureTopic { .. } | Request::DestroyTopic { .. } => Protocol::TopicService,
            Request::EnsurePublisher { .. }
            | Request::EnsureSubscriber { .. }
            | Request::ChannelCount
            | Request::SubscriberGroups => Protocol::NamedTopic,
            Request::Publish { .. } => Protocol::Publisher,
            Request::Receive { .. } => Protocol::Subscriber,
            Request::Query { .. } => Protocol::InvocationService,
            Request::Lookup { .. } => Protocol::NameService,
        }
    }

    pub fn type_id(&self) -> u16 {
        use type_id::*;
        match self {
            Request::EnsureCache { .. } => ENSURE_CACHE,
            Request::DestroyCache { .. } => DESTROY_CACHE,
            Request::Size => SIZE,
            Request::ContainsKey { .. } => CONTAINS_KEY,
            Request::Get { .. } => GET,
            Request::Put { .. } => PUT,
            Request::Remove { .. } => REMOVE,
            Request::Clear => CLEAR,
            Request::Keys => KEYS,
            Request::GetAll { .. } => GET_ALL,
            Request::EnsureTopic { .. } => ENSURE_TOPIC,
            Request::DestroyTopic { .. } => DESTROY_TOPIC,
            Request::EnsurePublisher { .. } => ENSURE_PUBLISHER,
            Request::EnsureSubscriber { .. } => ENSURE_SUBSCRIBER,
            Request::ChannelCount => CHANNEL_COUNT,
            Request::SubscriberGroups => SUBSCRIBER_GROUPS,
            Request::Publish { .. } => PUBLISH,
            Request::Receive { .. } => RECEIVE,
            Request::Query { .. } => QUERY,
            Request::Lookup { .. } => LOOKUP,
        }
    }

    /// Operation name used in logs and timeout errors.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::EnsureCache { .. } => "EnsureCache",
            Request::DestroyCache { .. } => "DestroyCache",
            Request::Size => "Size",
            Request::ContainsKey { .. } => "ContainsKey",
            Request::Get { .. } => "Get",
            Request::Put { .. } => "Put",
            Request::Remove { .. } => "Remove",
            Request::Clear => "Clear",
            Request::Keys => "Keys",
            Request::GetAll { .. } => "GetAll",
            Request::EnsureTopic { .. } => "EnsureTopic",
            Request::DestroyTopic { .. } => "DestroyTopic",
            Request::EnsurePublisher { .. } => "EnsurePublisher",
            Request::EnsureSubscriber { .. } => "EnsureSubscriber",
            Request::ChannelCount => "ChannelCount",
            Request::SubscriberGroups => "SubscriberGroups",
            Request::Publish { .. } => "Publish",
            Request::Receive { .. } => "Receive",
            Request::Query { .. } => "Query",
            Request::Lookup { .. } => "Lookup",
        }
    }

    /// Positional arguments, the inverse of [`MessageFactory::create_message`].
    pub fn args(&self) -> Vec<Value> {
        match self {
            Request::EnsureCache { name }
            | Request::DestroyCache { name }
            | Request::EnsureTopic { name }
            | Request::DestroyTopic { name }
            | Request::Lookup { name } => vec![Value::from(name.as_str())],
            Request::Size
            | Request::Clear
            | Request::Keys
            | Request::ChannelCount
            | Request::SubscriberGroups => Vec::new(),
            Request::ContainsKey { key } | Request::Get { key } | Request::Remove { key } => {
                vec![Value::Bytes(key.clone())]
            }
            Request::Put { key, value } => vec![Value::Bytes(key.clone()), Value::Bytes(value.clone())],
            Request::GetAll { keys } => vec![Value::Array(
                keys.iter().cloned().map(Value::Bytes).collect(),
            )],
            Request::EnsurePublisher { channel_count } => vec![Value::from(*channel_count)],
            Request::EnsureSubscriber { group } => vec![Value::from(group.clone())],
            Request::Publish { values } => vec![Value::Array(
                values.iter().cloned().map(Value::Bytes).collect(),
            )],
            Request::Receive { max } => vec![Value::from(*max)],
            Request::Query { task, payload } => {
                vec![Value::from(task.as_str()), Value::Bytes(payload.clone())]
            }
        }
    }

    // ===== Wire form =====

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.protocol().id());
        buf.extend_from_slice(&self.type_id().to_be_bytes());
        Value::Array(self.args()).encode_into(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let protocol = Protocol::from_id(reader.u8()?)?;
        let type_id = reader.u16()?;
        let args = match reader.value()? {
            Value::Array(args) => args,
            other => {
                return Err(Error::protocol(format!(
                    "request arguments must be an array, got {}",
                    other.type_name()
                )))
            }
        };
        reader.finish()?;
        MessageFactory::new(protocol).create_message(type_id, args)
    }
}

/// Builds typed requests for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFactory {
    protocol: Protocol,
}

impl MessageFactory {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether `request` belongs to this factory's protocol.
    pub fn accepts(&self, request: &Request) -> bool {
        request.protocol() == self.protocol
    }

    /// Build the request for `type_id` from positional arguments.
    pub fn create_message(&self, type_id: u16, args: Vec<Value>) -> Result<Request> {
        use type_id::*;
        let mut args = Args::new(self.protocol, type_id, args);
        let request = match (self.protocol, type_id) {
            (Protocol::CacheService, ENSURE_CACHE) => Request::EnsureCache { name: args.text()? },
            (Protocol::CacheService, DESTROY_CACHE) => Request::DestroyCache { name: args.text()? },

            (Protocol::NamedCache, SIZE) => Request::Size,
            (Protocol::NamedCache, CONTAINS_KEY) => Request::ContainsKey { key: args.bytes()? },
            (Protocol::NamedCache, GET) => Request::Get { key: args.bytes()? },
            (Protocol::NamedCache, PUT) => Request::Put {
                key: args.bytes()?,
                value: args.bytes()?,
            },
            (Protocol::NamedCache, REMOVE) => Request::Remove { key: args.bytes()? },
            (Protocol::NamedCache, CLEAR) => Request::Clear,
            (Protocol::NamedCache, KEYS) => Request::Keys,
            (Protocol::NamedCache, GET_ALL) => Request::GetAll { keys: args.byte_list()? },

            (Protocol::TopicService, ENSURE_TOPIC) => Request::EnsureTopic { name: args.text()? },
            (Protocol::TopicService, DESTROY_TOPIC) => Request::DestroyTopic { name: args.text()? },

            (Protocol::NamedTopic, ENSURE_PUBLISHER) => Request::EnsurePublisher {
                channel_count: args.count()?,
            },
            (Protocol::NamedTopic, ENSURE_SUBSCRIBER) => Request::EnsureSubscriber {
                group: args.opt_text()?,
            },
            (Protocol::NamedTopic, CHANNEL_COUNT) => Request::ChannelCount,
            (Protocol::NamedTopic, SUBSCRIBER_GROUPS) => Request::SubscriberGroups,

            (Protocol::Publisher, PUBLISH) => Request::Publish { values: args.byte_list()? },
            (Protocol::Subscriber, RECEIVE) => Request::Receive { max: args.count()? },

            (Protocol::InvocationService, QUERY) => Request::Query {
                task: args.text()?,
                payload: args.bytes()?,
            },

            (Protocol::NameService, LOOKUP) => Request::Lookup { name: args.text()? },

            (protocol, type_id) => {
                return Err(Error::protocol(format!(
                    "type id {} is not part of the {} protocol",
                    type_id, protocol
                )))
            }
        };
        args.finish()?;
        Ok(request)
    }
}

/// Positional argument cursor with descriptive errors.
struct Args {
    protocol: Protocol,
    type_id: u16,
    items: std::vec::IntoIter<Value>,
    index: usize,
}

impl Args {
    fn new(protocol: Protocol, type_id: u16, args: Vec<Value>) -> Self {
        Self {
            protocol,
            type_id,
            items: args.into_iter(),
            index: 0,
        }
    }

    fn bad(&self, expected: &str, got: &Value) -> Error {
        Error::protocol(format!(
            "{} type {} argument {}: expected {}, got {}",
            self.protocol,
            self.type_id,
            self.index,
            expected,
            got.type_name()
        ))
    }

    fn next(&mut self) -> Value {
        self.index += 1;
        self.items.next().unwrap_or(Value::Null)
    }

    fn text(&mut self) -> Result<String> {
        match self.next() {
            Value::Text(s) => Ok(s),
            other => Err(self.bad("text", &other)),
        }
    }

    fn opt_text(&mut self) -> Result<Option<String>> {
        match self.next() {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => Err(self.bad("text or null", &other)),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        match self.next() {
            Value::Bytes(b) => Ok(b),
            other => Err(self.bad("bytes", &other)),
        }
    }

    fn count(&mut self) -> Result<u32> {
        match self.next() {
            Value::Int(i) => u32::try_from(i).map_err(|_| {
                Error::protocol(format!(
                    "{} type {} argument {}: {} out of range",
                    self.protocol, self.type_id, self.index, i
                ))
            }),
            other => Err(self.bad("int", &other)),
        }
    }

    fn byte_list(&mut self) -> Result<Vec<Vec<u8>>> {
        match self.next() {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Bytes(b) => Ok(b),
                    other => Err(self.bad("array of bytes", &other)),
                })
                .collect(),
            other => Err(self.bad("array", &other)),
        }
    }

    fn finish(mut self) -> Result<()> {
        match self.items.next() {
            None => Ok(()),
            Some(_) => Err(Error::protocol(format!(
                "{} type {}: too many arguments",
                self.protocol, self.type_id
            ))),
        }
    }
}

/// Reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Value),
    Failure { code: u32, message: String },
}

const RESPONSE_OK: u8 = 0;
const RESPONSE_FAILURE: u8 = 1;

impl Response {
    pub fn failure(code: u32, message: impl Into<String>) -> Self {
        Response::Failure {
            code,
            message: message.into(),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Response::Ok(value) => Ok(value),
            Response::Failure { code, message } => Err(Error::Remote { code, message }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Ok(value) => {
                buf.push(RESPONSE_OK);
                value.encode_into(&mut buf);
            }
            Response::Failure { code, message } => {
                buf.push(RESPONSE_FAILURE);
                buf.extend_from_slice(&code.to_be_bytes());
                super::value::put_str(&mut buf, message);
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let response = match reader.u8()? {
            RESPONSE_OK => Response::Ok(reader.value()?),
            RESPONSE_FAILURE => Response::Failure {
                code: reader.u32()?,
                message: reader.string()?,
            },
            tag => return Err(Error::protocol(format!("unknown response tag {}", tag))),
        };
        reader.finish()?;
        Ok(response)
    }
}

impl From<Result<Value>> for Response {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Response::Ok(value),
            Err(Error::Remote { code, message }) => Response::Failure { code, message },
            Err(e) => Response::failure(code_for(&e), e.to_string()),
        }
    }
}

/// Failure codes reported by the proxy.
pub mod failure_code {
    pub const INTERNAL: u32 = 1;
    pub const ILLEGAL_ARGUMENT: u32 = 2;
    pub const NOT_FOUND: u32 = 3;
    pub const PROTOCOL: u32 = 4;
    pub const STATE: u32 = 5;
}

fn code_for(e: &Error) -> u32 {
    use crate::error::ErrorKind;
    match e {
        Error::Protocol(_) => failure_code::PROTOCOL,
        _ => match e.kind() {
            ErrorKind::Validation => failure_code::ILLEGAL_ARGUMENT,
            ErrorKind::State => failure_code::STATE,
            _ => failure_code::INTERNAL,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_foreign_type_id() {
        let factory = MessageFactory::new(Protocol::NameService);
        let err = factory
            .create_message(type_id::DESTROY_CACHE, vec![Value::from("orders")])
            .unwrap_err();
        assert!(err.to_string().contains("NameService"));
    }

    #[test]
    fn test_factory_validates_argument_types() {
        let factory = MessageFactory::new(Protocol::CacheService);
        assert!(factory
            .create_message(type_id::ENSURE_CACHE, vec![Value::Int(1)])
            .is_err());
        assert!(factory
            .create_message(type_id::ENSURE_CACHE, vec![])
            .is_err());
        assert!(factory
            .create_message(
                type_id::ENSURE_CACHE,
                vec![Value::from("a"), Value::from("b")]
            )
            .is_err());
        assert_eq!(
            factory
                .create_message(type_id::ENSURE_CACHE, vec![Value::from("orders")])
                .unwrap(),
            Request::EnsureCache {
                name: "orders".into()
            }
        );
    }

    #[test]
    fn test_every_request_decodes_to_itself() {
        let requests = vec![
            Request::EnsureCache { name: "c".into() },
            Request::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            Request::GetAll {
                keys: vec![b"a".to_vec(), b"b".to_vec()],
            },
            Request::EnsureSubscriber { group: None },
            Request::EnsureSubscriber {
                group: Some("g".into()),
            },
            Request::EnsurePublisher { channel_count: 4 },
            Request::Publish {
                values: vec![b"x".to_vec()],
            },
            Request::Query {
                task: "echo".into(),
                payload: vec![1, 2],
            },
            Request::Lookup {
                name: "ExtendProxy".into(),
            },
        ];
        for request in requests {
            assert_eq!(Request::decode(&request.encode()).unwrap(), request);
        }
    }

    #[test]
    fn test_remote_failure_maps_to_error() {
        let response = Response::decode(&Response::failure(3, "no such cache").encode()).unwrap();
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, Error::Remote { code: 3, .. }));
    }
}
