//! Expiring-entry cache.
//!
//! Entries expire a fixed time after insertion. Expiry is checked lazily on
//! access: there is no timer, so the cache behaves identically under a
//! virtual clock.
//!
//! Entries sit in a queue in insertion order. Because the clock never goes
//! backwards, the queue is also expiry order and purging only ever looks at
//! its front.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    ops::Sub,
    time::Duration,
};

/// Map whose entries expire `ttl` after insertion.
#[derive(Debug, Clone)]
pub struct ExpiringMap<K, V, I> {
    ttl: Duration,
    entries: HashMap<K, (I, V)>,
    order: VecDeque<(I, K)>,
}

impl<K, V, I> ExpiringMap<K, V, I>
where
    K: Eq + Hash + Clone,
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty map.
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: HashMap::new(), order: VecDeque::new() }
    }

    /// Time-to-live for new entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh `key` at `now`.
    pub fn insert(&mut self, key: K, value: V, now: I) {
        self.purge(now);
        self.order.push_back((now, key.clone()));
        self.entries.insert(key, (now, value));
    }

    /// Live value for `key`.
    pub fn get(&mut self, key: &K, now: I) -> Option<&V> {
        self.purge(now);
        self.entries.get(key).map(|(_, v)| v)
    }

    /// Live mutable value for `key`.
    pub fn get_mut(&mut self, key: &K, now: I) -> Option<&mut V> {
        self.purge(now);
        self.entries.get_mut(key).map(|(_, v)| v)
    }

    /// Whether `key` is live.
    pub fn contains(&mut self, key: &K, now: I) -> bool {
        self.get(key, now).is_some()
    }

    /// Remove `key` regardless of age.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Number of live entries.
    pub fn len(&mut self, now: I) -> usize {
        self.purge(now);
        self.entries.len()
    }

    /// Whether no entries are live.
    pub fn is_empty(&mut self, now: I) -> bool {
        self.len(now) == 0
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Drop entries older than the ttl.
    pub fn purge(&mut self, now: I) {
        while let Some((inserted, _)) = self.order.front() {
            if now - *inserted < self.ttl {
                break;
            }
            let Some((inserted, key)) = self.order.pop_front() else {
                break;
            };
            // A refreshed key has a newer queue entry; only the matching one
            // removes it
            if self.entries.get(&key).is_some_and(|(at, _)| *at == inserted) {
                self.entries.remove(&key);
            }
        }
    }
}

/// Set whose members expire `ttl` after insertion.
#[derive(Debug, Clone)]
pub struct ExpiringSet<K, I> {
    inner: ExpiringMap<K, (), I>,
}

impl<K, I> ExpiringSet<K, I>
where
    K: Eq + Hash + Clone,
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty set.
    pub fn new(ttl: Duration) -> Self {
        Self { inner: ExpiringMap::new(ttl) }
    }

    /// Insert or refresh `key`.
    pub fn insert(&mut self, key: K, now: I) {
        self.inner.insert(key, (), now);
    }

    /// Whether `key` is live.
    pub fn contains(&mut self, key: &K, now: I) -> bool {
        self.inner.contains(key, now)
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &K) -> bool {
        self.inner.remove(key).is_some()
    }

    /// Number of live members.
    pub fn len(&mut self, now: I) -> usize {
        self.inner.len(now)
    }

    /// Whether no members are live.
    pub fn is_empty(&mut self, now: I) -> bool {
        self.inner.is_empty(now)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Milliseconds on a fake clock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct Ms(u64);

    impl Sub for Ms {
        type Output = Duration;

        fn sub(self, rhs: Self) -> Duration {
            Duration::from_millis(self.0.saturating_sub(rhs.0))
        }
    }

    #[test]
    fn entries_expire_at_ttl() {
        let mut set = ExpiringSet::new(Duration::from_secs(60));
        set.insert("env-1", Ms(0));

        assert!(set.contains(&"env-1", Ms(59_999)));
        assert!(!set.contains(&"env-1", Ms(60_000)));
    }

    #[test]
    fn refresh_extends_lifetime() {
        let mut set = ExpiringSet::new(Duration::from_secs(5));
        set.insert("bob", Ms(0));
        set.insert("bob", Ms(4_000));

        // The stale queue entry from t=0 must not evict the refreshed one
        assert!(set.contains(&"bob", Ms(6_000)));
        assert!(!set.contains(&"bob", Ms(9_000)));
    }

    #[test]
    fn remove_is_immediate() {
        let mut map = ExpiringMap::new(Duration::from_secs(30));
        map.insert("bob", 3u32, Ms(0));

        assert_eq!(map.remove(&"bob"), Some(3));
        assert!(map.is_empty(Ms(1)));
    }

    #[test]
    fn get_mut_updates_value() {
        let mut map = ExpiringMap::new(Duration::from_secs(30));
        map.insert("bob", 1u32, Ms(0));

        if let Some(attempts) = map.get_mut(&"bob", Ms(10)) {
            *attempts += 1;
        }
        assert_eq!(map.get(&"bob", Ms(20)), Some(&2));
    }

    proptest! {
        #[test]
        fn membership_matches_naive_model(
            ops in prop::collection::vec((0u8..8, 0u64..5_000), 1..64),
        ) {
            let ttl = Duration::from_millis(1_000);
            let mut set = ExpiringSet::new(ttl);
            let mut model: HashMap<u8, u64> = HashMap::new();
            let mut now = 0u64;

            for (key, step) in ops {
                now += step % 700;
                set.insert(key, Ms(now));
                model.insert(key, now);

                for probe in 0u8..8 {
                    let expected = model.get(&probe).is_some_and(|at| now - at < 1_000);
                    prop_assert_eq!(set.contains(&probe, Ms(now)), expected);
                }
            }
        }
    }
}
