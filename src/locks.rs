//! Named mutual exclusion
//!
//! Check-then-create sequences (SR attach, network creation, tunnel bridge
//! setup) are serialized by the stable name of their target.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RawMutex};
use parking_lot::lock_api::ArcMutexGuard;

/// Guard held for the duration of a keyed critical section.
pub type KeyGuard = ArcMutexGuard<RawMutex, ()>;

/// One mutex per key, created on first use and dropped once idle.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `key` is held.
    pub fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut map = self.inner.lock();
            // Only the map holds an idle slot; holders and waiters own a clone.
            map.retain(|k, slot| k == key || Arc::strong_count(slot) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_arc()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
