use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Keyed cache with per-entry TTL.
///
/// The engine only owns the chat domain; other domains (notes, websites,
/// scratchpad, memories) keep their data behind this cache, and the engine's
/// only interaction is dropping keys when a side-effect tool invalidated them.
pub trait KeyedCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value, ttl: Duration);
    fn remove(&self, key: &str);
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// In-memory `KeyedCache` with lazy expiry on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyedCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn remove(&self, key: &str) {
        if self.entries.lock().remove(key).is_some() {
            debug!(key = %key, "cache key dropped");
        }
    }
}
