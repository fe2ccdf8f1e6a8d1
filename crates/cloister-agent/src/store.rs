//! Worker-local view of the module cache.
//!
//! Seeded from the request's `cache` field before any module is built, so
//! constructors can read saved state synchronously. Saves update the local
//! map and are reported to the host as `cache.save` events.

use crate::emitter::Emitter;
use cloister_core::protocol::CacheEntry;
use cloister_core::Event;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: Arc<Mutex<Map<String, Value>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge entries forwarded by the host.
    pub fn merge(&self, cache: Map<String, Value>) {
        if cache.is_empty() {
            return;
        }
        debug!(modules = cache.len(), "merging cached module state");
        self.lock().extend(cache);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    fn insert(&self, key: &str, value: Value) {
        self.lock().insert(key.to_string(), value);
    }

    /// Cache hooks bound to one module key.
    pub fn handle(&self, key: impl Into<String>, emitter: Emitter) -> CacheHandle {
        CacheHandle {
            key: key.into(),
            store: self.clone(),
            emitter,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `getCache` / `saveCache` for a single module.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    key: String,
    store: CacheStore,
    emitter: Emitter,
}

impl CacheHandle {
    /// Cache key, the module's basename.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last saved value, from this run or an earlier one.
    pub fn get_cache(&self) -> Option<Value> {
        self.store.get(&self.key)
    }

    /// Store `value` locally and ask the host to keep it for the next run.
    pub fn save_cache(&self, value: Value) {
        self.store.insert(&self.key, value.clone());
        self.emitter.emit(Event::CacheSave(CacheEntry {
            module: self.key.clone(),
            cache: value,
        }));
    }
}
