//! Keyed stores with time-to-live eviction.
//!
//! Each cache has its own lock, never held across an await point and
//! independent of every bus lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::sn::SerialNumber;
use crate::stats::{self, Event};

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    /// A cache whose entries live for `ttl`; zero disables it.
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, (V, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries();
        let ret = match entries.get(key) {
            Some((v, expiry)) if *expiry > Instant::now() => Some(v.clone()),
            Some(_) => {
                entries.remove(key);
                stats::record(Event::CacheExpire);
                None
            }
            None => None,
        };
        stats::record(if ret.is_some() { Event::CacheHit } else { Event::CacheMiss });
        ret
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_for(key, value, self.ttl)
    }

    /// Insert with a lifetime other than the cache default.
    pub fn insert_for(&self, key: K, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.entries().insert(key, (value, Instant::now() + ttl));
        stats::record(Event::CacheAdd);
    }

    pub fn remove(&self, key: &K) {
        self.entries().remove(key);
    }

    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.entries().retain(|k, _| keep(k));
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

/// Positional directory cache: slot `(bus, i)` holds the i-th device found
/// on that bus. A `None` slot marks the end of the listing.
pub struct DirectoryCache {
    slots: TtlCache<(usize, usize), Option<SerialNumber>>,
}

impl DirectoryCache {
    pub fn new(ttl: Duration) -> Self {
        DirectoryCache {
            slots: TtlCache::new(ttl),
        }
    }

    /// Forget the listing of `bus` before enumerating it again.
    pub fn begin(&self, bus: usize) {
        self.slots.retain(|&(b, _)| b != bus);
    }

    pub fn put(&self, bus: usize, index: usize, sn: SerialNumber) {
        self.slots.insert((bus, index), Some(sn));
    }

    /// Place the deletion marker after the last valid entry.
    pub fn finish(&self, bus: usize, len: usize) {
        self.slots.insert((bus, len), None);
    }

    /// Replace the listing of `bus` in one go.
    pub fn store(&self, bus: usize, devices: &[SerialNumber]) {
        self.begin(bus);
        for (i, sn) in devices.iter().enumerate() {
            self.put(bus, i, *sn);
        }
        self.finish(bus, devices.len());
    }

    /// The complete cached listing, or `None` when any slot up to the
    /// marker is missing or expired.
    pub fn list(&self, bus: usize) -> Option<Vec<SerialNumber>> {
        let mut found = Vec::new();
        loop {
            match self.slots.get(&(bus, found.len()))? {
                Some(sn) => found.push(sn),
                None => return Some(found),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.insert("a", 1);
        cache.insert_for("b", 2, Duration::from_secs(30));
        assert_eq!(cache.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn zero_ttl_stores_nothing() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.insert(1u8, "x");
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn directory_marker_ends_listing() {
        let dir = DirectoryCache::new(Duration::from_secs(60));
        let a = SerialNumber::new(0x21, [1, 0, 0, 0, 0, 0]);
        let b = SerialNumber::new(0x09, [2, 0, 0, 0, 0, 0]);
        assert_eq!(dir.list(0), None);

        dir.store(0, &[a, b]);
        assert_eq!(dir.list(0), Some(vec![a, b]));

        // a shorter rescan must hide the stale trailing slot
        dir.store(0, &[b]);
        assert_eq!(dir.list(0), Some(vec![b]));
        assert_eq!(dir.list(1), None);
    }
}
