// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tasks run when a service stops.
//!
//! Blocking calls that must be interruptible register a task before they
//! block and drop the returned [`TaskRegistration`] after. Stopping the
//! service runs every task still registered.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registry {
    tasks: HashMap<u64, Task>,
    next_id: u64,
    closed: bool,
}

/// Close-on-exit task registry (cheap to clone, shared).
#[derive(Clone)]
pub struct CloseOnExit {
    inner: Arc<Mutex<Registry>>,
    owner: Arc<str>,
}

impl CloseOnExit {
    pub fn new(owner: &str) -> Self {
        Self {
            inner: Arc::default(),
            owner: Arc::from(owner),
        }
    }

    /// Register `task`. Fails with [`Error::ServiceStopped`] once closed.
    pub fn register<F>(&self, task: F) -> Result<TaskRegistration>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut registry = self.inner.lock();
        if registry.closed {
            return Err(Error::ServiceStopped(self.owner.to_string()));
        }
        registry.next_id += 1;
        let id = registry.next_id;
        registry.tasks.insert(id, Box::new(task));
        Ok(TaskRegistration {
            registry: Arc::clone(&self.inner),
            id,
        })
    }

    /// Close the registry and run every registered task.
    pub fn close_all(&self) {
        let tasks: Vec<Task> = {
            let mut registry = self.inner.lock();
            registry.closed = true;
            registry.tasks.drain().map(|(_, t)| t).collect()
        };
        if !tasks.is_empty() {
            log::debug!("[SERVICE] {}: running {} close-on-exit task(s)", self.owner, tasks.len());
        }
        for task in tasks {
            task();
        }
    }

    /// Accept registrations again (service restarted).
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

/// Deregisters its task on drop without running it.
pub struct TaskRegistration {
    registry: Arc<Mutex<Registry>>,
    id: u64,
}

impl Drop for TaskRegistration {
    fn drop(&mut self) {
        self.registry.lock().tasks.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dropped_registration_does_not_run() {
        let registry = CloseOnExit::new("svc");
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = Arc::clone(&runs);
            let _reg = registry
                .register(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert_eq!(registry.pending(), 1);
        }
        registry.close_all();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_runs_tasks_and_refuses_new_ones() {
        let registry = CloseOnExit::new("svc");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let _reg = registry
            .register(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        registry.close_all();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(matches!(registry.register(|| {}), Err(Error::ServiceStopped(_))));

        registry.reopen();
        assert!(registry.register(|| {}).is_ok());
    }
}
