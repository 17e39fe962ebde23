// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ambient per-thread deadline.
//!
//! A caller can bound every blocking service call it makes for a while:
//!
//! ```
//! use extend_client::service::Deadline;
//! use std::time::Duration;
//!
//! let _deadline = Deadline::after(Duration::from_millis(500));
//! assert!(Deadline::remaining().is_some());
//! ```

use std::cell::Cell;
use std::time::{Duration, Instant};

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Restores the previous deadline on drop.
pub struct Deadline {
    previous: Option<Instant>,
}

impl Deadline {
    /// Set the thread's deadline to `timeout` from now. A tighter enclosing
    /// deadline stays in effect.
    pub fn after(timeout: Duration) -> Deadline {
        let wanted = Instant::now() + timeout;
        let previous = DEADLINE.with(|d| d.get());
        let effective = match previous {
            Some(outer) if outer < wanted => outer,
            _ => wanted,
        };
        DEADLINE.with(|d| d.set(Some(effective)));
        Deadline { previous }
    }

    /// Time left before the thread's deadline, `None` when none is set.
    pub fn remaining() -> Option<Duration> {
        DEADLINE
            .with(|d| d.get())
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The shorter of `timeout` and the remaining ambient time.
    pub fn bound(timeout: Option<Duration>) -> Option<Duration> {
        match (timeout, Self::remaining()) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (t, r) => t.or(r),
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        let previous = self.previous;
        DEADLINE.with(|d| d.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_takes_minimum() {
        assert_eq!(Deadline::bound(None), None);
        assert_eq!(
            Deadline::bound(Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );

        let _deadline = Deadline::after(Duration::from_millis(200));
        let bounded = Deadline::bound(Some(Duration::from_secs(3))).unwrap();
        assert!(bounded <= Duration::from_millis(200));
        assert!(Deadline::bound(None).is_some());
    }

    #[test]
    fn test_nested_deadline_cannot_extend() {
        let _outer = Deadline::after(Duration::from_millis(100));
        {
            let _inner = Deadline::after(Duration::from_secs(60));
            assert!(Deadline::remaining().unwrap() <= Duration::from_millis(100));
        }
        assert!(Deadline::remaining().is_some());
    }

    #[test]
    fn test_guard_restores_none() {
        {
            let _d = Deadline::after(Duration::from_secs(1));
        }
        assert!(Deadline::remaining().is_none());
    }
}
