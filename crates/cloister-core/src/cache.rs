//! Per-module state carried between invocations.
//!
//! Workers persist state by emitting `cache.save`; the controller applies it
//! here, and the next request naming the same module gets it back in its
//! `cache` field. Nothing is written to disk: embedders that want durability
//! register a save hook and feed `restore` on startup.

use crate::protocol::RequiredModule;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

type SaveHook = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Default)]
struct Inner {
    entries: RwLock<HashMap<String, Value>>,
    hook: RwLock<Option<SaveHook>>,
}

/// Shared last-write-wins map from module basename to saved state.
///
/// Cloning yields another handle on the same store.
#[derive(Clone, Default)]
pub struct ModuleCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCache")
            .field("modules", &self.len())
            .finish()
    }
}

impl ModuleCache {
    /// Create an empty, unshared store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide store used by sandboxes that were not given one.
    pub fn shared() -> Self {
        static SHARED: OnceLock<ModuleCache> = OnceLock::new();
        SHARED.get_or_init(ModuleCache::new).clone()
    }

    /// Record `value` for `module`. Returns whether the stored value changed.
    pub fn apply(&self, module: &str, value: Value) -> bool {
        let changed = {
            let mut entries = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
            if entries.get(module) == Some(&value) {
                false
            } else {
                entries.insert(module.to_string(), value.clone());
                true
            }
        };

        if changed {
            tracing::debug!(module = %module, "Cached data for module");
            let hook = self.inner.hook.read().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(hook) = hook {
                hook(module, &value);
            }
        } else {
            tracing::trace!(module = %module, "Cache entry unchanged");
        }
        changed
    }

    /// Saved state for one module.
    pub fn get(&self, module: &str) -> Option<Value> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .cloned()
    }

    /// Entries for the given modules, keyed by basename, for a request's `cache` field.
    pub fn subset_for(&self, required: &[RequiredModule]) -> Map<String, Value> {
        let entries = self.inner.entries.read().unwrap_or_else(|e| e.into_inner());
        required
            .iter()
            .filter_map(|r| {
                let key = r.key();
                entries.get(key).map(|v| (key.to_string(), v.clone()))
            })
            .collect()
    }

    /// Copy of every entry, for external persistence.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Load entries saved earlier by an external store. Does not fire the save hook.
    pub fn restore(&self, saved: impl IntoIterator<Item = (String, Value)>) {
        let mut entries = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.extend(saved);
    }

    /// Register a listener called after every change.
    pub fn set_save_hook<F>(&self, hook: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        *self.inner.hook.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    /// Number of modules with saved state.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether nothing has been saved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_apply_is_idempotent() {
        let cache = ModuleCache::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        cache.set_save_hook(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        assert!(cache.apply("m", json!({"x": 1})));
        let before = cache.snapshot();
        assert!(!cache.apply("m", json!({"x": 1})));
        assert!(!cache.apply("m", json!({"x": 1})));
        assert_eq!(cache.snapshot(), before);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let cache = ModuleCache::new();
        cache.apply("m", json!(1));
        cache.apply("m", json!(2));
        assert_eq!(cache.get("m"), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_subset_uses_module_basename() {
        let cache = ModuleCache::new();
        cache.apply("counter", json!({"count": 3}));
        cache.apply("other", json!(true));

        let subset = cache.subset_for(&[
            RequiredModule::new("./ipc_modules/counter"),
            RequiredModule::new("missing"),
        ]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset["counter"], json!({"count": 3}));
    }

    #[test]
    fn test_restore_and_clone_share_state() {
        let cache = ModuleCache::new();
        let handle = cache.clone();
        handle.restore([("m".to_string(), json!("saved"))]);
        assert_eq!(cache.get("m"), Some(json!("saved")));
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_shared_is_one_store() {
        ModuleCache::shared().apply("shared-test-module", json!(7));
        assert_eq!(ModuleCache::shared().get("shared-test-module"), Some(json!(7)));
    }
}
