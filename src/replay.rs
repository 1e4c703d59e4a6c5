//! Replay cursor tracking.
//!
//! The store maps a normalized topic to the last replay position observed
//! for it. Resubscribing from the stored position (rather than the
//! originally requested sentinel) is what prevents both gaps and duplicate
//! delivery across reconnects.

use dashmap::DashMap;

/// Request delivery from the earliest event retained for the topic.
pub const REPLAY_FROM_EARLIEST: i64 = -2;

/// Request delivery of new events only.
pub const REPLAY_FROM_TIP: i64 = -1;

/// Strip the query string and any trailing slashes from a topic path.
///
/// The normalized form is the unique key for cursors and
/// duplicate-subscription detection. The raw form (query string intact) is
/// still what the transport sees for channel addressing.
#[must_use]
pub fn normalize_topic(raw: &str) -> String {
    let without_query = raw.split('?').next().unwrap_or(raw);
    without_query.trim_end_matches('/').to_owned()
}

/// Concurrent map from normalized topic to last-known replay position.
#[derive(Debug, Default)]
pub struct ReplayStore {
    cursors: DashMap<String, i64>,
}

impl ReplayStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current cursor for a normalized topic.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<i64> {
        self.cursors.get(key).map(|entry| *entry.value())
    }

    /// Record the latest observed position for a normalized topic.
    pub fn put(&self, key: &str, position: i64) {
        self.cursors.insert(key.to_owned(), position);
    }

    /// Seed a cursor only if none exists yet.
    ///
    /// Returns `false` when a cursor was already present; callers use this
    /// as the duplicate-subscription check.
    pub fn insert_if_absent(&self, key: &str, position: i64) -> bool {
        match self.cursors.entry(key.to_owned()) {
            dashmap::Entry::Occupied(_) => false,
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(position);
                true
            }
        }
    }

    /// Drop the cursor for a normalized topic.
    pub fn remove(&self, key: &str) {
        self.cursors.remove(key);
    }

    /// Forget every cursor. Done at the start of a fresh connector
    /// lifetime, never on reconnect.
    pub fn clear(&self) {
        self.cursors.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
