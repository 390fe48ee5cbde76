use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Map whose entries lapse a fixed time after their last write.
///
/// Expired entries are purged lazily on access; there are no timers.
#[derive(Debug)]
pub struct ExpiringMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<K: Eq + Hash + Clone, V> ExpiringMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_at(key, value, Instant::now())
    }

    pub fn insert_at(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        self.purge_expired_at(now);
        self.entries
            .insert(
                key,
                Entry {
                    value,
                    expires_at: now + self.ttl,
                },
            )
            .map(|old| old.value)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<&V> {
        self.drop_if_expired(key, now);
        self.entries.get(key).map(|e| &e.value)
    }

    /// Mutable access; refreshes the entry's deadline.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.get_mut_at(key, Instant::now())
    }

    pub fn get_mut_at(&mut self, key: &K, now: Instant) -> Option<&mut V> {
        self.drop_if_expired(key, now);
        let ttl = self.ttl;
        self.entries.get_mut(key).map(|e| {
            e.expires_at = now + ttl;
            &mut e.value
        })
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_at(key, Instant::now())
    }

    pub fn remove_at(&mut self, key: &K, now: Instant) -> Option<V> {
        self.drop_if_expired(key, now);
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn contains_key_at(&mut self, key: &K, now: Instant) -> bool {
        self.get_at(key, now).is_some()
    }

    /// Returns how many entries were dropped.
    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drop_if_expired(&mut self, key: &K, now: Instant) {
        let expired = self
            .entries
            .get(key)
            .map(|e| e.expires_at <= now)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_lapse_after_ttl() {
        let start = Instant::now();
        let mut map = ExpiringMap::new(Duration::from_secs(10));
        map.insert_at("a", 1, start);
        assert_eq!(map.get_at(&"a", start + Duration::from_secs(9)), Some(&1));
        assert_eq!(map.get_at(&"a", start + Duration::from_secs(10)), None);
        assert!(map.is_empty());
    }

    #[test]
    fn mutable_access_extends_deadline() {
        let start = Instant::now();
        let mut map = ExpiringMap::new(Duration::from_secs(10));
        map.insert_at("a", 1, start);
        if let Some(v) = map.get_mut_at(&"a", start + Duration::from_secs(8)) {
            *v += 1;
        }
        assert_eq!(map.get_at(&"a", start + Duration::from_secs(15)), Some(&2));
    }

    #[test]
    fn insert_purges_other_expired_entries() {
        let start = Instant::now();
        let mut map = ExpiringMap::new(Duration::from_secs(5));
        map.insert_at("old", 1, start);
        map.insert_at("new", 2, start + Duration::from_secs(6));
        assert_eq!(map.len(), 1);
        assert!(map.contains_key_at(&"new", start + Duration::from_secs(6)));
    }

    #[test]
    fn remove_returns_live_value_only() {
        let start = Instant::now();
        let mut map = ExpiringMap::new(Duration::from_secs(5));
        map.insert_at("a", 1, start);
        map.insert_at("b", 2, start);
        assert_eq!(map.remove_at(&"a", start + Duration::from_secs(1)), Some(1));
        assert_eq!(map.remove_at(&"b", start + Duration::from_secs(5)), None);
    }

    #[test]
    fn reinserting_returns_previous_value() {
        let mut map = ExpiringMap::new(Duration::from_secs(60));
        assert_eq!(map.insert("k", "first"), None);
        assert_eq!(map.insert("k", "second"), Some("first"));
        assert_eq!(map.get(&"k"), Some(&"second"));
        assert_eq!(map.remove(&"k"), Some("second"));
    }
}
