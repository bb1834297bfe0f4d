// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session admission and cancellation primitives.
//!
//! Admission is a compare-and-swap counter handing out RAII permits: the
//! slot is released when the permit drops, on every exit path: success,
//! error, panic unwind, cancellation.  Nothing ever has to remember to
//! decrement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Bounded concurrent-session admission counter.
#[derive(Debug, Default)]
pub struct SessionCounter {
    active: AtomicUsize,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a slot iff the current count is below `limit`.
    pub fn try_acquire(counter: &Arc<Self>, limit: usize) -> Option<SessionPermit> {
        counter
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()
            .map(|_| SessionPermit { counter: Arc::clone(counter) })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn release(&self) {
        // Floors at zero; a double release is a bug but must not wrap.
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

/// An occupied admission slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SessionPermit {
    counter: Arc<SessionCounter>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.counter.release();
    }
}

/// Maps session ids to the cancellation handle of their in-flight run.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `session_id`, replacing any stale one.
    pub fn register(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap()
            .insert(session_id.to_string(), token.clone());
        token
    }

    /// Signal cancellation.  Returns whether a run was registered.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.tokens.lock().unwrap().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().unwrap().remove(session_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_up_to_limit_then_refuse() {
        let counter = Arc::new(SessionCounter::new());
        let a = SessionCounter::try_acquire(&counter, 2);
        let b = SessionCounter::try_acquire(&counter, 2);
        assert!(a.is_some() && b.is_some());
        assert_eq!(counter.active(), 2);
        assert!(SessionCounter::try_acquire(&counter, 2).is_none());
        assert_eq!(counter.active(), 2, "failed acquire must not bump the count");
    }

    #[test]
    fn dropping_the_permit_releases_the_slot() {
        let counter = Arc::new(SessionCounter::new());
        {
            let _permit = SessionCounter::try_acquire(&counter, 1).unwrap();
            assert_eq!(counter.active(), 1);
        }
        assert_eq!(counter.active(), 0);
        assert!(SessionCounter::try_acquire(&counter, 1).is_some());
    }

    #[test]
    fn release_floors_at_zero() {
        let counter = SessionCounter::new();
        counter.release();
        assert_eq!(counter.active(), 0);
    }

    #[test]
    fn permit_survives_a_panic_unwind() {
        let counter = Arc::new(SessionCounter::new());
        let held = Arc::clone(&counter);
        let result = std::panic::catch_unwind(move || {
            let _permit = SessionCounter::try_acquire(&held, 1).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(counter.active(), 0);
    }

    #[test]
    fn cancel_registry_signals_registered_tokens() {
        let registry = CancelRegistry::new();
        let token = registry.register("s1");
        assert!(!token.is_cancelled());
        assert!(registry.cancel("s1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_session_is_false() {
        let registry = CancelRegistry::new();
        assert!(!registry.cancel("ghost"));
    }

    #[test]
    fn re_register_replaces_the_token() {
        let registry = CancelRegistry::new();
        let old = registry.register("s1");
        let new = registry.register("s1");
        registry.cancel("s1");
        assert!(!old.is_cancelled());
        assert!(new.is_cancelled());
    }
}
