//! Non-blocking keyed locks
//!
//! A second caller for the same key is refused immediately rather than
//! queued behind the first. A key is in the map only while its guard is
//! alive, so the map never outgrows the work in flight.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Held while the keyed work runs; released on drop
pub struct KeyGuard {
    key: String,
    held: Arc<DashMap<String, ()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

#[derive(Default)]
pub struct KeyedLocks {
    held: Arc<DashMap<String, ()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, or `None` if someone else holds it
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        match self.held.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(KeyGuard {
                    key: key.to_string(),
                    held: self.held.clone(),
                })
            }
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// Keys currently held
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
