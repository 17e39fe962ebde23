// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scoped reference store.
//!
//! Maps `(name, scope, subject?)` to a resource proxy. Reads are lock-free
//! (`DashMap`); creation is serialized per name by a timed mutex:
//!
//! 1. look up without locking, return an active hit
//! 2. take the per-name lock (bounded by [`LockWait`])
//! 3. look up again, another thread may have created it meanwhile
//! 4. create and store
//!
//! An inactive proxy is treated as absent and replaced.

use super::scope::{Scope, Subject};
use crate::error::{Error, Result};
use crate::net::duration_to_ms;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A proxy that can go stale.
pub trait ScopedResource: Send + Sync {
    fn is_active(&self) -> bool;
}

/// How long to wait for a per-name lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Wait until the lock is free.
    Indefinite,
    /// Give up with [`Error::Timeout`] after this long.
    Bounded(Duration),
}

impl LockWait {
    /// `ms <= 0` waits indefinitely.
    pub fn from_timeout_ms(ms: i64) -> Self {
        match u64::try_from(ms) {
            Ok(ms) if ms > 0 => LockWait::Bounded(Duration::from_millis(ms)),
            _ => LockWait::Indefinite,
        }
    }

    pub fn is_indefinite(&self) -> bool {
        matches!(self, LockWait::Indefinite)
    }
}

/// Store key. The subject is only set for subject-scoped services.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    name: String,
    scope: Scope,
    subject: Option<Subject>,
}

impl StoreKey {
    pub fn new(name: impl Into<String>, scope: Scope, subject: Option<Subject>) -> Self {
        Self {
            name: name.into(),
            scope,
            subject,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{}@{:?}#{}", self.name, self.scope, subject),
            None => write!(f, "{}@{:?}", self.name, self.scope),
        }
    }
}

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Held per-name lock; released on drop.
///
/// The table entry goes away with the last holder or waiter, so the table
/// only grows with names under contention.
pub struct NameLock {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    name: String,
    table: Arc<LockTable>,
}

impl Drop for NameLock {
    fn drop(&mut self) {
        // Unlock first: afterwards only the table and waiters hold the mutex.
        self.guard.take();
        prune(&self.table, &self.name);
    }
}

/// Remove the entry for `name` if nobody holds or waits on it.
fn prune(table: &LockTable, name: &str) {
    table.remove_if(name, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Per-service cache of resource proxies.
pub struct ScopedReferenceStore<T: ScopedResource> {
    entries: DashMap<StoreKey, Arc<T>>,
    locks: Arc<LockTable>,
}

impl<T: ScopedResource> Default for ScopedReferenceStore<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl<T: ScopedResource> ScopedReferenceStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored proxy, active or not.
    pub fn get(&self, key: &StoreKey) -> Option<Arc<T>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Stored proxy if it is still active.
    pub fn get_active(&self, key: &StoreKey) -> Option<Arc<T>> {
        self.get(key).filter(|r| r.is_active())
    }

    /// Store `resource`, returning the proxy it replaced.
    pub fn put(&self, key: StoreKey, resource: Arc<T>) -> Option<Arc<T>> {
        self.entries.insert(key, resource)
    }

    /// Remove the entry for `key` only if it is `resource` itself.
    pub fn remove_if(&self, key: &StoreKey, resource: &Arc<T>) -> bool {
        self.entries
            .remove_if(key, |_, stored| Arc::ptr_eq(stored, resource))
            .is_some()
    }

    /// Remove and return every proxy.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let keys: Vec<StoreKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter()
            .filter_map(|k| self.entries.remove(k).map(|(_, v)| v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct resource names currently stored.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Names with a lock currently held or awaited.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Take the per-name creation lock.
    pub fn lock(&self, name: &str, wait: LockWait) -> Result<NameLock> {
        let mutex = Arc::clone(
            self.locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = match wait {
            LockWait::Indefinite => mutex.lock_arc(),
            LockWait::Bounded(timeout) => match mutex.try_lock_arc_for(timeout) {
                Some(guard) => guard,
                None => {
                    drop(mutex);
                    prune(&self.locks, name);
                    return Err(Error::Timeout {
                        resource: name.to_string(),
                        waited_ms: duration_to_ms(timeout),
                    });
                }
            },
        };
        Ok(NameLock {
            guard: Some(guard),
            name: name.to_string(),
            table: Arc::clone(&self.locks),
        })
    }

    /// Return the active proxy for `key`, creating it under the name lock.
    ///
    /// `create` runs at most once per miss and only while the lock is held.
    /// Its error propagates and nothing is stored.
    pub fn get_or_create<F>(&self, key: StoreKey, wait: LockWait, create: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<Arc<T>>,
    {
        if let Some(found) = self.get_active(&key) {
            return Ok(found);
        }

        let _lock = self.lock(&key.name, wait)?;
        if let Some(found) = self.get_active(&key) {
            log::trace!("[STORE] {:?} created while waiting for lock", key);
            return Ok(found);
        }

        let created = create()?;
        if let Some(stale) = self.entries.insert(key.clone(), Arc::clone(&created)) {
            log::debug!(
                "[STORE] replaced inactive {:?} (active: {})",
                key,
                stale.is_active()
            );
        }
        Ok(created)
    }
}
