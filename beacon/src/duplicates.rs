use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use metrics::gauge;

use crate::event::EventContext;

/// Identity of one tracked event. Clients retransmit beacons with the same
/// identifiers, which is what makes a retransmission recognisable.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DuplicateKey {
    pub party_id: String,
    pub session_id: String,
    pub page_view_id: String,
    pub event_id: String,
}

impl From<&EventContext> for DuplicateKey {
    fn from(context: &EventContext) -> Self {
        Self {
            party_id: context.party_id.clone(),
            session_id: context.session_id.clone(),
            page_view_id: context.page_view_id.clone(),
            event_id: context.event_id.clone(),
        }
    }
}

/// Remembers the last `capacity` distinct events. Lookups are exact, so a
/// reported duplicate really was seen; events that aged out of the window
/// are reported as new again.
pub struct DuplicateMemory {
    recent: Mutex<LruCache<DuplicateKey, ()>>,
}

impl DuplicateMemory {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns true if `key` is a probable duplicate. Either way the key
    /// becomes the most recently seen one, evicting the oldest key when
    /// the memory is full.
    pub fn check_and_remember(&self, key: DuplicateKey) -> bool {
        // A panic while holding the lock can't leave the cache half updated
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let duplicate = recent.put(key, ()).is_some();
        gauge!("beacon_duplicate_memory_size").set(recent.len() as f64);
        duplicate
    }

    pub fn len(&self) -> usize {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cap()
            .get()
    }
}
