use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::store::LockStore;
use crate::config::RetroverseConfig;
use crate::error::{ErrorCode, Result, RetroError};
use crate::key::DatonKey;
use crate::util::{generate_token, now_millis};

/// Attempts at creating a missing version row before giving up
const VERSION_INIT_ATTEMPTS: usize = 5;

struct LocalLock {
    key: DatonKey,
    session_key: String,
    version: String,
}

/// This process's view of a record's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    pub is_locked: bool,
    pub is_locked_by_me: bool,
    pub version_at_lock: Option<String>,
}

/// Optimistic lock and version authority.
///
/// Locks held by sessions of this process are mirrored in a local map; the
/// shared [`LockStore`] is authoritative and every conflict defers to it.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    server_id: String,
    local: DashMap<String, LocalLock>,
    lock_staleness: Duration,
    retention: Duration,
    purge_interval: Duration,
    overlap: Duration,
    last_check: Mutex<i64>,
    last_purge: Mutex<Instant>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn new_version() -> String {
    generate_token(9)
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, config: &RetroverseConfig) -> Self {
        let server_id = uuid::Uuid::new_v4().to_string();
        log::info!("Lock manager started as server {}", server_id);
        Self {
            store,
            server_id,
            local: DashMap::new(),
            lock_staleness: config.lock_staleness,
            retention: config.lock_retention,
            purge_interval: config.lock_purge_interval,
            overlap: config.peer_change_overlap,
            last_check: Mutex::new(now_millis()),
            last_purge: Mutex::new(Instant::now()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Current version of a record, creating the store row on first access
    pub fn get_version(&self, key: &DatonKey) -> Result<String> {
        for _ in 0..VERSION_INIT_ATTEMPTS {
            if let Some(version) = self.store.read_version(key.as_str())? {
                return Ok(version);
            }
            let version = new_version();
            if self
                .store
                .insert_version(key.as_str(), &version, &self.server_id, now_millis())?
            {
                return Ok(version);
            }
        }
        Err(RetroError::LockStore(format!(
            "could not initialize version of {}",
            key
        )))
    }

    /// Local view only
    pub fn get_lock_state(&self, key: &DatonKey, session_key: &str) -> LockState {
        match self.local.get(key.as_str()) {
            Some(lock) => LockState {
                is_locked: true,
                is_locked_by_me: lock.session_key == session_key,
                version_at_lock: Some(lock.version.clone()),
            },
            None => LockState {
                is_locked: false,
                is_locked_by_me: false,
                version_at_lock: None,
            },
        }
    }

    /// Lock `key` for `session_key` if the record is still at `expected_version`.
    pub fn request_lock(
        &self,
        key: &DatonKey,
        expected_version: &str,
        session_key: &str,
    ) -> std::result::Result<(), ErrorCode> {
        if !key.is_record() || key.is_new() {
            return Err(ErrorCode::Internal);
        }
        if let Some(lock) = self.local.get(key.as_str()) {
            return if lock.session_key == session_key {
                Ok(())
            } else {
                Err(ErrorCode::Locked)
            };
        }

        let now = now_millis();
        let stale_before = now - millis(self.lock_staleness);
        let acquired = self
            .store
            .try_acquire(key.as_str(), expected_version, session_key, now, stale_before)
            .map_err(|e| {
                log::warn!("Lock request for {} failed: {}", key, e);
                ErrorCode::Internal
            })?;

        if acquired {
            self.local.insert(
                key.to_string(),
                LocalLock {
                    key: key.clone(),
                    session_key: session_key.to_string(),
                    version: expected_version.to_string(),
                },
            );
            log::debug!("Locked {} at {}", key, expected_version);
            return Ok(());
        }

        match self.store.read_version(key.as_str()) {
            Ok(Some(current)) if current == expected_version => Err(ErrorCode::Locked),
            Ok(_) => Err(ErrorCode::VersionConflict),
            Err(e) => {
                log::warn!("Could not read version of {}: {}", key, e);
                Err(ErrorCode::Internal)
            }
        }
    }

    /// Give a locked record a fresh version. The lock stays held.
    pub fn assign_new_version(
        &self,
        key: &DatonKey,
        session_key: &str,
    ) -> std::result::Result<String, ErrorCode> {
        let mut lock = match self.local.get_mut(key.as_str()) {
            Some(lock) if lock.session_key == session_key => lock,
            _ => return Err(ErrorCode::Locked),
        };
        let version = new_version();
        let written = self
            .store
            .write_version(key.as_str(), session_key, &version, &self.server_id, now_millis())
            .map_err(|e| {
                log::warn!("Could not write version of {}: {}", key, e);
                ErrorCode::Internal
            })?;
        if !written {
            drop(lock);
            self.local.remove(key.as_str());
            log::warn!("Lock on {} was lost to another session", key);
            return Err(ErrorCode::Locked);
        }
        lock.version = version.clone();
        Ok(version)
    }

    /// Release a lock held by `session_key`. The local record is forgotten even
    /// when the store cannot be updated.
    pub fn release_lock(&self, key: &DatonKey, session_key: &str) -> bool {
        let removed = self
            .local
            .remove_if(key.as_str(), |_, lock| lock.session_key == session_key)
            .is_some();
        if !removed && self.local.contains_key(key.as_str()) {
            return false;
        }
        match self.store.release(key.as_str(), session_key) {
            Ok(released) => removed || released,
            Err(e) => {
                log::warn!("Could not release {} in lock store: {}", key, e);
                removed
            }
        }
    }

    /// Release every lock held by a session; returns the released keys
    pub fn release_locks_for_session(&self, session_key: &str) -> Vec<DatonKey> {
        let keys: Vec<DatonKey> = self
            .local
            .iter()
            .filter(|entry| entry.session_key == session_key)
            .map(|entry| entry.key.clone())
            .collect();
        for key in &keys {
            self.release_lock(key, session_key);
        }
        keys
    }

    /// Heartbeat held locks, purge long-unused rows, and report records
    /// written by other server processes since the previous call.
    pub fn inter_server_process(&self) -> Result<Vec<(DatonKey, String)>> {
        let now = now_millis();

        let held: Vec<String> = self.local.iter().map(|e| e.key().clone()).collect();
        if !held.is_empty() {
            self.store.touch(&held, now)?;
        }

        {
            let mut last_purge = self.last_purge.lock();
            if last_purge.elapsed() >= self.purge_interval {
                let purged = self.store.purge_untouched(now - millis(self.retention))?;
                if purged > 0 {
                    log::info!("Purged {} unused lock rows", purged);
                }
                *last_purge = Instant::now();
            }
        }

        let since = *self.last_check.lock() - millis(self.overlap);
        let changes = self.store.changed_since(since, &self.server_id)?;
        *self.last_check.lock() = now;

        Ok(changes
            .into_iter()
            .filter_map(|(key, version)| match DatonKey::parse(&key) {
                Ok(key) => Some((key, version)),
                Err(e) => {
                    log::warn!("Ignoring lock row with bad key: {}", e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;

    fn manager(store: &Arc<MemoryLockStore>) -> LockManager {
        LockManager::new(store.clone(), &RetroverseConfig::default())
    }

    fn manager_with_staleness(store: &Arc<MemoryLockStore>, lock_staleness: Duration) -> LockManager {
        let config = RetroverseConfig {
            lock_staleness,
            ..RetroverseConfig::default()
        };
        LockManager::new(store.clone(), &config)
    }

    #[test]
    fn test_get_version_initializes_once() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager(&store);
        let key = DatonKey::record("Customer", "5");
        let v1 = locks.get_version(&key).unwrap();
        assert_eq!(locks.get_version(&key).unwrap(), v1);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_two_sessions_one_process() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager(&store);
        let key = DatonKey::record("Customer", "5");
        let v1 = locks.get_version(&key).unwrap();

        assert_eq!(locks.request_lock(&key, &v1, "a"), Ok(()));
        assert_eq!(locks.request_lock(&key, &v1, "a"), Ok(()));
        assert_eq!(locks.request_lock(&key, &v1, "b"), Err(ErrorCode::Locked));

        let state = locks.get_lock_state(&key, "b");
        assert!(state.is_locked && !state.is_locked_by_me);
        assert_eq!(state.version_at_lock, Some(v1.clone()));

        assert!(locks.release_lock(&key, "a"));
        assert_eq!(locks.request_lock(&key, &v1, "b"), Ok(()));
    }

    #[test]
    fn test_two_processes_exclusion() {
        let store = Arc::new(MemoryLockStore::new());
        let first = manager(&store);
        let second = manager(&store);
        let key = DatonKey::record("Customer", "5");
        let v1 = first.get_version(&key).unwrap();

        let results = [
            first.request_lock(&key, &v1, "a"),
            second.request_lock(&key, &v1, "b"),
        ];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(results[1], Err(ErrorCode::Locked));
    }

    #[test]
    fn test_stale_version_is_conflict_not_locked() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager(&store);
        let key = DatonKey::record("Customer", "5");
        let v1 = locks.get_version(&key).unwrap();

        locks.request_lock(&key, &v1, "a").unwrap();
        let v2 = locks.assign_new_version(&key, "a").unwrap();
        assert_ne!(v1, v2);
        assert_eq!(locks.get_lock_state(&key, "a").version_at_lock, Some(v2.clone()));
        locks.release_lock(&key, "a");

        assert_eq!(locks.request_lock(&key, &v1, "b"), Err(ErrorCode::VersionConflict));
        assert_eq!(locks.get_version(&key).unwrap(), v2);
    }

    #[test]
    fn test_assign_requires_lock() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager(&store);
        let key = DatonKey::record("Customer", "5");
        locks.get_version(&key).unwrap();
        assert_eq!(locks.assign_new_version(&key, "a"), Err(ErrorCode::Locked));
    }

    #[test]
    fn test_release_locks_for_session() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager(&store);
        let k1 = DatonKey::record("Customer", "1");
        let k2 = DatonKey::record("Customer", "2");
        let v1 = locks.get_version(&k1).unwrap();
        let v2 = locks.get_version(&k2).unwrap();
        locks.request_lock(&k1, &v1, "a").unwrap();
        locks.request_lock(&k2, &v2, "b").unwrap();

        let released = locks.release_locks_for_session("a");
        assert_eq!(released, vec![k1.clone()]);
        assert!(store.holder(k1.as_str()).is_none());
        assert_eq!(store.holder(k2.as_str()).as_deref(), Some("b"));
    }

    #[test]
    fn test_inter_server_reports_only_peer_writes() {
        let store = Arc::new(MemoryLockStore::new());
        let here = manager(&store);
        let peer = manager(&store);
        let mine = DatonKey::record("Customer", "1");
        let theirs = DatonKey::record("Customer", "2");

        let v = here.get_version(&mine).unwrap();
        here.request_lock(&mine, &v, "a").unwrap();
        here.assign_new_version(&mine, "a").unwrap();

        let v = peer.get_version(&theirs).unwrap();
        peer.request_lock(&theirs, &v, "b").unwrap();
        let peer_version = peer.assign_new_version(&theirs, "b").unwrap();

        let changes = here.inter_server_process().unwrap();
        assert!(changes.contains(&(theirs.clone(), peer_version)));
        assert!(!changes.iter().any(|(k, _)| *k == mine));
    }

    #[test]
    fn test_stale_lock_is_reclaimed_by_peer() {
        let store = Arc::new(MemoryLockStore::new());
        let holder = manager_with_staleness(&store, Duration::from_millis(1));
        let peer = manager_with_staleness(&store, Duration::from_millis(1));
        let key = DatonKey::record("Customer", "5");
        let v1 = holder.get_version(&key).unwrap();
        assert_eq!(holder.request_lock(&key, &v1, "a"), Ok(()));

        // No heartbeat from the holder, so the hold goes stale
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(peer.request_lock(&key, &v1, "b"), Ok(()));
        assert!(peer.get_lock_state(&key, "b").is_locked_by_me);

        assert_eq!(holder.assign_new_version(&key, "a"), Err(ErrorCode::Locked));
        assert!(!holder.get_lock_state(&key, "a").is_locked_by_me);
        assert!(peer.assign_new_version(&key, "b").is_ok());
    }

    #[test]
    fn test_heartbeat_keeps_lock_fresh() {
        let store = Arc::new(MemoryLockStore::new());
        let staleness = Duration::from_millis(400);
        let holder = manager_with_staleness(&store, staleness);
        let peer = manager_with_staleness(&store, staleness);
        let key = DatonKey::record("Customer", "5");
        let v1 = holder.get_version(&key).unwrap();
        assert_eq!(holder.request_lock(&key, &v1, "a"), Ok(()));

        // Each wait is under the window; together they exceed it
        std::thread::sleep(Duration::from_millis(250));
        holder.inter_server_process().unwrap();
        std::thread::sleep(Duration::from_millis(250));

        assert_eq!(peer.request_lock(&key, &v1, "b"), Err(ErrorCode::Locked));
        assert!(holder.assign_new_version(&key, "a").is_ok());
    }
}
