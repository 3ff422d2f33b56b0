//! In-process [`ResourceCache`].
//!
//! Holds entry bodies and a stale flag per key, and keeps a log of every
//! operation. Useful for headless embedders and for asserting what the
//! bridge did.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;

use cvesync_core::errors::CacheApplyError;

use super::{CacheKey, CacheOp, ResourceCache};

#[derive(Default)]
struct Store {
    entries: HashMap<CacheKey, Value>,
    stale: HashSet<CacheKey>,
    log: Vec<CacheOp>,
}

/// Map-backed cache with an operation log.
#[derive(Default)]
pub struct MemoryCache {
    store: Mutex<Store>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.lock();
        f.debug_struct("MemoryCache")
            .field("entries", &store.entries.len())
            .field("stale", &store.stale.len())
            .finish_non_exhaustive()
    }
}

impl MemoryCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry as fresh.
    pub fn insert(&self, key: CacheKey, body: Value) {
        let mut store = self.store.lock();
        let _ = store.stale.remove(&key);
        let _ = store.entries.insert(key, body);
    }

    /// Current body of an entry.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.store.lock().entries.get(key).cloned()
    }

    /// Whether an entry was invalidated since it was last written.
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.store.lock().stale.contains(key)
    }

    /// Invalidations applied to `key` so far.
    pub fn invalidations(&self, key: &CacheKey) -> usize {
        self.store
            .lock()
            .log
            .iter()
            .filter(|op| matches!(op, CacheOp::Invalidate(k) if k == key))
            .count()
    }

    /// Every operation applied so far.
    pub fn ops(&self) -> Vec<CacheOp> {
        self.store.lock().log.clone()
    }
}

impl ResourceCache for MemoryCache {
    fn invalidate(&self, key: &CacheKey) -> Result<(), CacheApplyError> {
        let mut store = self.store.lock();
        let _ = store.stale.insert(key.clone());
        store.log.push(CacheOp::Invalidate(key.clone()));
        Ok(())
    }

    fn patch(&self, key: &CacheKey, body: &Value) -> Result<(), CacheApplyError> {
        let Value::Object(fields) = body else {
            return Err(CacheApplyError::new(
                "patch",
                key.to_string(),
                "patch body is not an object",
            ));
        };
        let mut store = self.store.lock();
        let entry = store
            .entries
            .entry(key.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        match entry {
            Value::Object(existing) => {
                for (field, value) in fields {
                    let _ = existing.insert(field.clone(), value.clone());
                }
            }
            other => *other = body.clone(),
        }
        store.log.push(CacheOp::Patch {
            key: key.clone(),
            body: body.clone(),
        });
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> Result<(), CacheApplyError> {
        let mut store = self.store.lock();
        let _ = store.entries.remove(key);
        let _ = store.stale.remove(key);
        store.log.push(CacheOp::Evict(key.clone()));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
