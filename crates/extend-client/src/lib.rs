// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # extend-client - remote services over a multiplexed proxy connection
//!
//! Client-side service layer for a cluster reached through a proxy. Each
//! remote service keeps one physical connection to the proxy and opens
//! logical channels over it: one per service, plus one per cache, topic,
//! publisher or subscriber handed out to the application.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use extend_client::{RemoteCacheService, Result, Scope, ServiceContext, ServiceDependencies};
//!
//! fn main() -> Result<()> {
//!     let deps = ServiceDependencies::default().with_proxy_address("127.0.0.1:9099");
//!     let context = ServiceContext::tcp(&deps);
//!     let service = RemoteCacheService::new(deps, context)?;
//!     service.start()?;
//!
//!     let scope = Scope::new("orders-app");
//!     let cache = service.ensure_cache("orders", Some(&scope))?;
//!     cache.put(b"k1", b"v1")?;
//!     assert_eq!(cache.get(b"k1")?, Some(b"v1".to_vec()));
//!
//!     service.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          Application                                |
//! |   RemoteNamedCache | RemoteNamedTopic | Publisher | Subscriber      |
//! +---------------------------------------------------------------------+
//! |                          Services                                   |
//! |   Cache | Topic | Invocation | Name   (each composes RemoteService) |
//! |   ScopedReferenceStore | Scope/Subject | CloseOnExit | Deadline     |
//! +---------------------------------------------------------------------+
//! |                      Connection / Channel                           |
//! |   ConnectionInitiator -> Connection -> Channel (one per protocol)   |
//! +---------------------------------------------------------------------+
//! |                     Protocol / Transport                            |
//! |   Frame codec | Value | ChannelUri | TcpSocket | UdpSocket          |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RemoteCacheService`] | Hands out named cache proxies, one per name and scope |
//! | [`RemoteTopicService`] | Hands out named topic proxies with publishers and subscribers |
//! | [`RemoteInvocationService`] | Runs named tasks on the proxy's member |
//! | [`RemoteNameService`] | Resolves names, over the channel or by datagram |
//! | [`ServiceDependencies`] | Cluster, addresses, timeouts and socket options |
//! | [`ServiceContext`] | Connection initiator plus the resource event dispatcher |
//!
//! The [`server`] module holds an in-memory proxy used by tests and by the
//! `extendctl` tool.

/// Service configuration (dependencies, env overrides, config files).
pub mod config;
/// Connections, channels and the initiators that create them.
pub mod connection;
/// Error types.
pub mod error;
/// Resource lifecycle events.
pub mod events;
/// Managed sockets (TCP stream, TCP accepter, UDP datagram).
pub mod net;
/// Wire protocol (values, messages, frames, channel URIs, discovery datagrams).
pub mod protocol;
/// In-memory proxy: backend, per-connection sessions, TCP acceptor, name responder.
pub mod server;
/// Remote services and the resource proxies they hand out.
pub mod service;

pub use config::ServiceDependencies;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventDispatcher, EventFilter, EventKind, ResourceEvent, ResourceType};
pub use protocol::Value;
pub use service::{
    RemoteCacheService, RemoteInvocationService, RemoteNameService, RemoteNamedCache,
    RemoteNamedTopic, RemotePublisher, RemoteService, RemoteSubscriber, RemoteTopicService, Scope,
    ServiceContext, Subject,
};
