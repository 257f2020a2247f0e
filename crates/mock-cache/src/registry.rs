use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Operations the registry can apply to every live cache at once.
pub(crate) trait RegisteredCache: Send + Sync {
    fn clear(&self);
    fn enforce_capacity(&self, max_size_override: Option<usize>);
}

/// Process-wide switches shared by every [`crate::TtlLruCache`] built against it.
///
/// Construct one at startup and hand clones to each component that creates a cache.
/// Caches register on construction and deregister when dropped.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    enabled: AtomicBool,
    max_size_override: AtomicUsize,
    next_cache_id: AtomicU64,
    caches: Mutex<HashMap<u64, Weak<dyn RegisteredCache>>>,
}

impl Default for RegistryInner {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            max_size_override: AtomicUsize::new(0),
            next_cache_id: AtomicU64::new(1),
            caches: Mutex::new(HashMap::new()),
        }
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns every cache operation into a no-op while `false`.
    pub fn set_all_caches_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!(enabled, "cache registry enabled flag changed");
    }

    pub fn caches_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Caps the capacity of every cache at `min(instance_max, max_size)`.
    ///
    /// `0` removes the override. Live caches above the new cap are trimmed oldest-first.
    pub fn set_max_size_override(&self, max_size: usize) {
        self.inner.max_size_override.store(max_size, Ordering::SeqCst);
        let override_value = self.max_size_override();
        for cache in self.live_caches() {
            cache.enforce_capacity(override_value);
        }
    }

    pub fn max_size_override(&self) -> Option<usize> {
        match self.inner.max_size_override.load(Ordering::SeqCst) {
            0 => None,
            value => Some(value),
        }
    }

    pub fn clear_all_caches(&self) {
        let caches = self.live_caches();
        tracing::debug!(caches = caches.len(), "clearing all registered caches");
        for cache in caches {
            cache.clear();
        }
    }

    pub fn live_cache_count(&self) -> usize {
        self.live_caches().len()
    }

    pub(crate) fn register(&self, cache: Weak<dyn RegisteredCache>) -> u64 {
        let id = self.inner.next_cache_id.fetch_add(1, Ordering::Relaxed);
        self.inner.caches.lock().insert(id, cache);
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.inner.caches.lock().remove(&id);
    }

    fn live_caches(&self) -> Vec<Arc<dyn RegisteredCache>> {
        let mut caches = self.inner.caches.lock();
        caches.retain(|_, cache| cache.strong_count() > 0);
        caches.values().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("enabled", &self.caches_enabled())
            .field("max_size_override", &self.max_size_override())
            .field("registered", &self.inner.caches.lock().len())
            .finish()
    }
}
