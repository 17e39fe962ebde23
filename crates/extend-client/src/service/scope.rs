// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resource scopes and security subjects.
//!
//! A [`Scope`] partitions resource proxies the way separate application
//! modules would: two scopes asking for the same cache name get distinct
//! proxies. Scopes compare by identity, not by name. Each thread may carry a
//! context scope that is used when a caller passes none.
//!
//! A [`Subject`] is the security identity requests run under. It travels
//! with channel creation and, when a service is configured subject-scoped,
//! becomes part of the reference-store key.

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

thread_local! {
    static CONTEXT_SCOPE: RefCell<Option<Scope>> = const { RefCell::new(None) };
    static CURRENT_SUBJECT: RefCell<Option<Subject>> = const { RefCell::new(None) };
}

/// Identity-compared resource scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<str>,
}

impl Scope {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            inner: Arc::from(name.as_ref()),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner
    }

    /// The calling thread's context scope.
    pub fn current() -> Option<Scope> {
        CONTEXT_SCOPE.with(|s| s.borrow().clone())
    }

    /// Make this the thread's context scope until the guard drops.
    pub fn enter(&self) -> ScopeGuard {
        let previous = CONTEXT_SCOPE.with(|s| s.replace(Some(self.clone())));
        ScopeGuard { previous }
    }

    /// Explicit scope, else the context scope, else [`Error::MissingContextScope`].
    pub fn resolve(scope: Option<&Scope>) -> Result<Scope> {
        match scope {
            Some(scope) => Ok(scope.clone()),
            None => Self::current().ok_or(Error::MissingContextScope),
        }
    }

    fn addr(&self) -> *const u8 {
        Arc::as_ptr(&self.inner) as *const u8
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({}@{:p})", self.inner, self.addr())
    }
}

/// Restores the previous context scope on drop.
pub struct ScopeGuard {
    previous: Option<Scope>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT_SCOPE.with(|s| *s.borrow_mut() = previous);
    }
}

/// Security identity a request runs under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subject {
    principal: String,
}

impl Subject {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The calling thread's subject.
    pub fn current() -> Option<Subject> {
        CURRENT_SUBJECT.with(|s| s.borrow().clone())
    }

    /// Run as this subject until the guard drops.
    pub fn enter(&self) -> SubjectGuard {
        let previous = CURRENT_SUBJECT.with(|s| s.replace(Some(self.clone())));
        SubjectGuard { previous }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.principal)
    }
}

/// Restores the previous subject on drop.
pub struct SubjectGuard {
    previous: Option<Subject>,
}

impl Drop for SubjectGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SUBJECT.with(|s| *s.borrow_mut() = previous);
    }
}
