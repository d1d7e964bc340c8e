//! Process-local cache of loaded datons.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::daton::Daton;
use crate::key::DatonKey;

struct CacheEntry {
    daton: Arc<Daton>,
    last_access: Instant,
}

/// Shared cache keyed by canonical daton key.
///
/// Cached datons are shared; callers that need to modify one must clone it.
#[derive(Default)]
pub struct DatonCache {
    entries: DashMap<String, CacheEntry>,
}

impl DatonCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a daton, refreshing its last-access time on a hit
    pub fn get(&self, key: &DatonKey) -> Option<Arc<Daton>> {
        let mut entry = self.entries.get_mut(key.as_str())?;
        entry.last_access = Instant::now();
        Some(entry.daton.clone())
    }

    /// Insert or replace the entry for the daton's key
    pub fn put(&self, daton: Arc<Daton>) {
        self.entries.insert(
            daton.key.to_string(),
            CacheEntry {
                daton,
                last_access: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &DatonKey) {
        self.entries.remove(key.as_str());
    }

    /// Evict every entry not accessed within `staleness` whose key is not
    /// pinned. Returns the number evicted.
    pub fn clean(&self, pinned: &HashSet<String>, staleness: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| pinned.contains(key) || entry.last_access.elapsed() < staleness);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            log::debug!("Evicted {} cached datons", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daton(key: &str) -> Arc<Daton> {
        Arc::new(Daton::new(DatonKey::parse(key).unwrap()))
    }

    #[test]
    fn test_get_put() {
        let cache = DatonCache::new();
        let key = DatonKey::record("Customer", "5");
        assert!(cache.get(&key).is_none());

        cache.put(daton("Customer|=5"));
        assert_eq!(cache.get(&key).unwrap().key, key);

        cache.put(Arc::new(Daton::new(key.clone()).with_version("v2")));
        assert_eq!(cache.get(&key).unwrap().version.as_deref(), Some("v2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clean_respects_pins() {
        let cache = DatonCache::new();
        cache.put(daton("Customer|=5"));
        cache.put(daton("Customer|=6"));

        let pinned: HashSet<String> = ["Customer|=5".to_string()].into_iter().collect();
        let evicted = cache.clean(&pinned, Duration::ZERO);

        assert_eq!(evicted, 1);
        assert!(cache.get(&DatonKey::record("Customer", "5")).is_some());
        assert!(cache.get(&DatonKey::record("Customer", "6")).is_none());
    }

    #[test]
    fn test_clean_keeps_fresh_entries() {
        let cache = DatonCache::new();
        cache.put(daton("Customer|=5"));
        assert_eq!(cache.clean(&HashSet::new(), Duration::from_secs(600)), 0);
        assert_eq!(cache.len(), 1);
    }
}
