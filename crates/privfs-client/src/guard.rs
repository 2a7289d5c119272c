// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Run-once teardown that also fires when its owner is dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use tracing::{debug, error};

type Action = Box<dyn FnOnce() + Send>;

pub struct CleanupGuard {
    label: &'static str,
    action: Mutex<Option<Action>>,
}

impl CleanupGuard {
    pub fn new(label: &'static str, action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Run the action unless it already ran. Returns whether this call ran it.
    ///
    /// A panicking action is logged and swallowed.
    pub fn run(&self) -> bool {
        let action = match self.action.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(action) = action else {
            return false;
        };
        if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
            error!(operation = "cleanup", label = self.label, "cleanup action panicked");
        }
        true
    }

    pub fn is_done(&self) -> bool {
        match self.action.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.run() {
            debug!(operation = "cleanup", label = self.label, "cleanup ran on drop");
        }
    }
}

impl std::fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("label", &self.label)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn runs_exactly_once_across_threads() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let guard = Arc::new(CleanupGuard::new("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                thread::spawn(move || guard.run())
            })
            .collect();
        let ran: usize = handles.into_iter().map(|h| h.join().unwrap() as usize).sum();

        assert_eq!(ran, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_runs_pending_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        {
            let _guard = CleanupGuard::new("test", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_action_is_contained() {
        let guard = CleanupGuard::new("test", || panic!("boom"));
        assert!(guard.run());
        assert!(guard.is_done());
        assert!(!guard.run());
    }
}
