//! Per-key mutual exclusion for the find-then-dispatch sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use vderive_models::DedupKey;

type LockMap = HashMap<DedupKey, Arc<AsyncMutex<()>>>;

/// Async locks keyed by [`DedupKey`]. Entries are dropped once no holder or
/// waiter remains.
#[derive(Clone, Default)]
pub struct KeyLocks {
    map: Arc<Mutex<LockMap>>,
}

/// Held lock for one key.
pub struct KeyGuard {
    key: DedupKey,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &DedupKey) -> KeyGuard {
        let lock = {
            let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;

        KeyGuard {
            key: key.clone(),
            guard: Some(guard),
            map: self.map.clone(),
        }
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map itself still references the lock.
        if map.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&self.key);
        }
    }
}
