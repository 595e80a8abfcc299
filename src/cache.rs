use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::resource::Resource;

/// Process-wide mirror of the observed cluster state, keyed by rendered
/// resource identifiers.
///
/// Cloning the cache clones the handle; all clones share one map. Writers are
/// the watch tasks and the executor, the planner only reads. Every operation
/// takes the lock briefly; `list` snapshots the key set first and re-locks per
/// entry while filtering, so a slow predicate never starves the watch tasks.
#[derive(Clone, Default)]
pub struct ResourceCache {
    inner: Arc<RwLock<HashMap<String, Resource>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        ResourceCache {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set(&self, key: &str, resource: Resource) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(key.to_string(), resource);
        }
    }

    pub fn get(&self, key: &str) -> Option<Resource> {
        self.inner.read().ok().and_then(|map| map.get(key).cloned())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner
            .read()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    pub fn delete(&self, key: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every entry matching the predicate.
    ///
    /// The key snapshot is taken under the read lock; filtering happens
    /// without holding it. Entries deleted between snapshot and filter are
    /// simply skipped.
    pub fn list<F>(&self, filter: F) -> Vec<String>
    where
        F: Fn(&Resource) -> bool,
    {
        let keys: Vec<String> = match self.inner.read() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => return Vec::new(),
        };

        keys.into_iter()
            .filter(|key| self.get(key).map(|res| filter(&res)).unwrap_or(false))
            .collect()
    }
}
