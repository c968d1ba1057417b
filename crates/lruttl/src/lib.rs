use lru_cache::LruCache;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Item<V> {
    item: V,
    expiration: Instant,
}

/// A bounded LRU cache whose entries additionally expire after a
/// per-entry deadline. Expiry is measured with the tokio clock so that
/// it follows a paused runtime in tests.
pub struct LruCacheWithTtl<K: Hash + Eq, V: Clone> {
    name: String,
    cache: Mutex<LruCache<K, Item<V>>>,
}

impl<K: Hash + Eq, V: Clone> LruCacheWithTtl<K, V> {
    pub fn new<S: Into<String>>(name: S, capacity: usize) -> Self {
        let name = name.into();
        tracing::debug!("created cache {name} with capacity {capacity}");
        Self {
            name,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut cache = self.cache.lock();
        let num_entries = cache.len();
        cache.clear();
        num_entries
    }

    pub fn get_with_expiry<Q: ?Sized>(&self, name: &Q) -> Option<(V, Instant)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(name)?;
        if Instant::now() < entry.expiration {
            Some((entry.item.clone(), entry.expiration))
        } else {
            cache.remove(name);
            None
        }
    }

    pub fn get<Q: ?Sized>(&self, name: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.get_with_expiry(name).map(|(item, _)| item)
    }

    pub fn insert(&self, name: K, item: V, expiration: Instant) -> V {
        self.cache.lock().insert(
            name,
            Item {
                item: item.clone(),
                expiration,
            },
        );
        item
    }

    /// Get an existing item, but if that item doesn't already exist,
    /// call `func` to provide a value that will be inserted and then
    /// returned.  This is done atomically wrt. other callers.
    pub fn get_or_insert<F: FnOnce() -> V>(&self, name: K, ttl: Duration, func: F) -> V {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get_mut(&name) {
            if Instant::now() < entry.expiration {
                return entry.item.clone();
            }
        }
        let item = func();
        cache.insert(
            name,
            Item {
                item: item.clone(),
                expiration: Instant::now() + ttl,
            },
        );
        item
    }
}

impl<K: Hash + Eq + Clone, V: Clone> LruCacheWithTtl<K, V> {
    /// Drop every entry whose deadline has passed.
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        let expired: Vec<K> = cache
            .iter()
            .filter(|(_, entry)| entry.expiration <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            cache.remove(k);
        }
        if !expired.is_empty() {
            tracing::trace!("purged {} expired entries from {}", expired.len(), self.name);
        }
        expired.len()
    }
}
