use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bounded cache with per-entry expiry. Backs the process-wide caches:
/// filters (24 h), market prices (1-5 min), proxy netload (2 s).
pub struct TtlCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().unwrap();
        match cache.get(key) {
            Some((stored, v)) if stored.elapsed() < self.ttl => Some(v.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V) {
        self.inner.lock().unwrap().put(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.lock().unwrap().pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(4, Duration::from_millis(20));
        cache.put("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"k"), None);
    }
}
