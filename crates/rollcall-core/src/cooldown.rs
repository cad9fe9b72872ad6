//! In-memory cooldown entries keyed by (identity, session).
//!
//! A recent mark suppresses further store round-trips for the same pairing,
//! and a separate notify window rate-limits the "already marked" signal.
//! Entries are never persisted and are evicted once idle long enough.

use crate::types::{Identity, SessionId};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Verdict for a mark attempt against the cooldown entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownState {
    /// No recent mark; the caller must consult the attendance store.
    Clear,
    /// Marked within the cooldown window. `notify` says whether the caller
    /// should raise a notification; when true the notify instant has already
    /// been recorded.
    Cooling { notify: bool },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_mark: Instant,
    last_notify: Instant,
}

impl Entry {
    fn last_seen(&self) -> Instant {
        self.last_mark.max(self.last_notify)
    }
}

pub struct CooldownStore {
    entries: Mutex<HashMap<(Identity, SessionId), Entry>>,
    cooldown: Duration,
    notify_window: Duration,
    eviction: Duration,
}

impl CooldownStore {
    pub fn new(cooldown: Duration, notify_window: Duration, eviction: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cooldown,
            notify_window,
            eviction,
        }
    }

    /// Check the pairing at `now`. Does not touch the mark instant.
    pub fn check(&self, identity: &Identity, session: SessionId, now: Instant) -> CooldownState {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(&(identity.clone(), session)) else {
            return CooldownState::Clear;
        };
        if now.saturating_duration_since(entry.last_mark) >= self.cooldown {
            return CooldownState::Clear;
        }
        let notify = now.saturating_duration_since(entry.last_notify) > self.notify_window;
        if notify {
            entry.last_notify = now;
        }
        CooldownState::Cooling { notify }
    }

    /// Record a completed store round-trip (which always notifies) at `now`,
    /// evicting idle entries on the way.
    pub fn record_mark(&self, identity: &Identity, session: SessionId, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let eviction = self.eviction;
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.last_seen()) < eviction);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle cooldown entries");
        }
        entries.insert(
            (identity.clone(), session),
            Entry {
                last_mark: now,
                last_notify: now,
            },
        );
    }

    /// Drop every entry whose identity satisfies `forgotten`, across sessions.
    pub fn forget(&self, forgotten: impl Fn(&Identity) -> bool) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _), _| !forgotten(id));
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
