// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote services.
//!
//! [`RemoteCacheService`], [`RemoteTopicService`],
//! [`RemoteInvocationService`] and [`RemoteNameService`] each compose a
//! [`RemoteService`] that owns the proxy connection. Cache and topic proxies
//! are kept in a [`ScopedReferenceStore`] so each `(name, scope)` maps to
//! one live proxy.

mod address;
mod base;
mod cache;
mod close_on_exit;
mod deadline;
mod invocation;
mod name;
mod scope;
mod store;
mod topic;

pub use address::{AddressProvider, ListAddressProvider};
pub use base::{
    normalize_name, RemoteService, ServiceContext, ServiceState, DEFAULT_RESOURCE_NAME,
};
pub use cache::{RemoteCacheService, RemoteNamedCache};
pub use close_on_exit::{CloseOnExit, TaskRegistration};
pub use deadline::Deadline;
pub use invocation::{InvocationObserver, InvocationTask, Member, RemoteInvocationService};
pub use name::RemoteNameService;
pub use scope::{Scope, ScopeGuard, Subject, SubjectGuard};
pub use store::{LockWait, NameLock, ScopedReferenceStore, ScopedResource, StoreKey};
pub use topic::{RemoteNamedTopic, RemotePublisher, RemoteSubscriber, RemoteTopicService};
