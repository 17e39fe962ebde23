// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy side: request handling, TCP proxy server, datagram name service.

mod acceptor;
mod backend;
mod discovery;
mod session;

pub use acceptor::ProxyServer;
pub use backend::{
    HandlerReply, InMemoryBackend, Invocable, ProxyBackend, SessionEffect, Target, TOPIC_DESTROYED,
};
pub use discovery::NameServiceResponder;
pub use session::{NotifySink, ProxySession};
