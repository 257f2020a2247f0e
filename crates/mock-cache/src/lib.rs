use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

mod registry;

pub use registry::CacheRegistry;
use registry::RegisteredCache;

/// Bounded key/value store with sliding per-entry TTL and oldest-first eviction.
///
/// Reads move a key to the most-recently-used end of the eviction queue and extend the
/// entry's life by its own TTL. Expired entries are dropped lazily on the read that finds
/// them. The eviction queue is a plain `VecDeque`, so touch and delete are linear in the
/// number of entries.
pub struct TtlLruCache<K, V> {
    id: u64,
    registry: CacheRegistry,
    shared: Arc<CacheShared<K, V>>,
}

struct CacheShared<K, V> {
    max_size: usize,
    default_ttl: Duration,
    state: Mutex<CacheState<K, V>>,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    order: VecDeque<K>,
}

struct CacheEntry<V> {
    ttl: Duration,
    // `None` when `now + ttl` does not fit in an `Instant`; such entries never expire.
    expires_at: Option<Instant>,
    value: V,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            ttl,
            expires_at: now.checked_add(ttl),
            value,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => deadline > now,
            None => true,
        }
    }

    fn refresh(&mut self, now: Instant) {
        self.expires_at = now.checked_add(self.ttl);
    }
}

impl<K, V> TtlLruCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(registry: &CacheRegistry, max_size: usize, default_ttl: Duration) -> Self {
        let shared = Arc::new(CacheShared {
            max_size,
            default_ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        });
        let registered: Arc<dyn RegisteredCache> = shared.clone();
        let id = registry.register(Arc::downgrade(&registered));
        Self {
            id,
            registry: registry.clone(),
            shared,
        }
    }

    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.shared.default_ttl);
    }

    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        if !self.registry.caches_enabled() {
            return;
        }
        let max_size = self.effective_max_size();
        if max_size == 0 {
            return;
        }

        let now = Instant::now();
        let mut state = self.shared.state.lock();
        if state.entries.remove(&key).is_some() {
            remove_from_order(&mut state.order, &key);
        }
        while state.entries.len() >= max_size {
            if !state.evict_oldest() {
                break;
            }
        }
        state.order.push_back(key.clone());
        state.entries.insert(key, CacheEntry::new(value, ttl, now));
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.registry.caches_enabled() {
            return None;
        }

        let now = Instant::now();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let entry = state.entries.get_mut(key)?;
        if entry.is_live(now) {
            entry.refresh(now);
            let value = entry.value.clone();
            touch_order(&mut state.order, key);
            Some(value)
        } else {
            state.entries.remove(key);
            remove_from_order(&mut state.order, key);
            None
        }
    }

    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.registry.caches_enabled() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.entries.remove(key).is_some() {
            remove_from_order(&mut state.order, key);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn effective_max_size(&self) -> usize {
        effective_max_size(self.shared.max_size, self.registry.max_size_override())
    }

    pub fn default_ttl(&self) -> Duration {
        self.shared.default_ttl
    }

    #[cfg(test)]
    fn order_snapshot(&self) -> Vec<K> {
        self.shared.state.lock().order.iter().cloned().collect()
    }
}

impl<K, V> Drop for TtlLruCache<K, V> {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl<K, V> RegisteredCache for CacheShared<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Send,
{
    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    fn enforce_capacity(&self, max_size_override: Option<usize>) {
        let max_size = effective_max_size(self.max_size, max_size_override);
        let mut state = self.state.lock();
        while state.entries.len() > max_size {
            if !state.evict_oldest() {
                break;
            }
        }
    }
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash,
{
    fn evict_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some(oldest) => {
                self.entries.remove(&oldest);
                true
            }
            None => false,
        }
    }
}

fn effective_max_size(instance_max: usize, max_size_override: Option<usize>) -> usize {
    match max_size_override {
        Some(limit) if limit > 0 => instance_max.min(limit),
        _ => instance_max,
    }
}

fn touch_order<K, Q>(order: &mut VecDeque<K>, key: &Q)
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    if let Some(position) = order.iter().position(|entry| entry.borrow() == key) {
        if let Some(existing) = order.remove(position) {
            order.push_back(existing);
        }
    }
}

fn remove_from_order<K, Q>(order: &mut VecDeque<K>, key: &Q)
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    if let Some(position) = order.iter().position(|entry| entry.borrow() == key) {
        order.remove(position);
    }
}
