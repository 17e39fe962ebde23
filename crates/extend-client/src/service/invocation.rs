// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote invocation service.
//!
//! Tasks run on the proxy's own member. Queries that name explicit members
//! are refused: the proxy executes on its behalf only.

use super::base::{RemoteService, ServiceContext};
use crate::config::ServiceDependencies;
use crate::connection::ConnectionListener;
use crate::error::{Error, Result};
use crate::protocol::{type_id, Protocol, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;

/// A named task plus its opaque argument payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationTask {
    pub name: String,
    pub payload: Vec<u8>,
}

impl InvocationTask {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Identity a result is reported under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    name: String,
}

impl Member {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Callbacks for [`RemoteInvocationService::execute`].
pub trait InvocationObserver: Send + Sync {
    fn member_completed(&self, member: &Member, result: &Value);

    fn member_failed(&self, member: &Member, error: &Error);

    /// Called last, after one of the member callbacks.
    fn invocation_completed(&self) {}
}

/// Client for a proxy's invocation service.
pub struct RemoteInvocationService {
    base: RemoteService,
    local_member: Member,
    me: Weak<RemoteInvocationService>,
}

impl RemoteInvocationService {
    pub const DEFAULT_NAME: &'static str = "RemoteInvocation";

    pub fn new(deps: ServiceDependencies, context: ServiceContext) -> Result<Arc<Self>> {
        let local_member = Member::new(deps.member_name.clone());
        let base = RemoteService::new(Self::DEFAULT_NAME, Protocol::InvocationService, deps, context)?;
        Ok(Arc::new_cyclic(move |weak: &Weak<Self>| Self {
            base: base.with_listener(weak.clone()),
            local_member,
            me: weak.clone(),
        }))
    }

    pub fn base(&self) -> &RemoteService {
        &self.base
    }

    pub fn local_member(&self) -> &Member {
        &self.local_member
    }

    pub fn start(&self) -> Result<()> {
        self.base.start()
    }

    pub fn stop(&self) {
        self.base.stop();
    }

    pub fn shutdown(&self) {
        self.base.shutdown();
    }

    /// Run `task` and wait for its result.
    ///
    /// `members` must be `None`; a member set fails with
    /// [`Error::DirectedQueryUnsupported`] before anything is sent. The
    /// result map has a single entry keyed by the local member.
    pub fn query(
        &self,
        task: &InvocationTask,
        members: Option<&[Member]>,
    ) -> Result<HashMap<Member, Value>> {
        validate(task, members)?;
        let value = self.invoke(task)?;
        Ok(HashMap::from([(self.local_member.clone(), value)]))
    }

    /// Run `task` on a worker thread and report to `observer`.
    ///
    /// Validation errors are returned immediately.
    pub fn execute(
        &self,
        task: &InvocationTask,
        members: Option<&[Member]>,
        observer: Arc<dyn InvocationObserver>,
    ) -> Result<thread::JoinHandle<()>> {
        validate(task, members)?;
        self.base.check_running()?;
        let service = self
            .me
            .upgrade()
            .ok_or_else(|| Error::ServiceStopped(self.base.name().to_string()))?;
        let task = task.clone();
        let handle = thread::Builder::new()
            .name(format!("extend-invoke-{}", task.name))
            .spawn(move || {
                let member = service.local_member.clone();
                match service.invoke(&task) {
                    Ok(value) => observer.member_completed(&member, &value),
                    Err(e) => observer.member_failed(&member, &e),
                }
                observer.invocation_completed();
            })?;
        Ok(handle)
    }

    fn invoke(&self, task: &InvocationTask) -> Result<Value> {
        let channel = self.base.ensure_channel()?;
        let request = channel.message_factory().create_message(
            type_id::QUERY,
            vec![
                Value::from(task.name.as_str()),
                Value::Bytes(task.payload.clone()),
            ],
        )?;
        log::debug!("[INVOKE] {}: query '{}'", self.base.name(), task.name);
        channel.request(request)
    }
}

fn validate(task: &InvocationTask, members: Option<&[Member]>) -> Result<()> {
    if members.is_some() {
        return Err(Error::DirectedQueryUnsupported);
    }
    if task.name.is_empty() {
        return Err(Error::IllegalArgument("invocation task must be named".into()));
    }
    Ok(())
}

impl ConnectionListener for RemoteInvocationService {
    fn connection_opened(&self, connection_id: u64) {
        self.base.connection_opened(connection_id);
    }

    fn connection_closed(&self, connection_id: u64) {
        self.base.connection_closed(connection_id);
    }

    fn connection_error(&self, connection_id: u64, error: &Error) {
        self.base.connection_error(connection_id, error);
    }
}
