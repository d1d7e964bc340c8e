//! In-memory lock store.
//!
//! One instance can be shared by several [`super::LockManager`]s to stand in
//! for a fleet of server processes in tests.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::store::{LockStore, StoreResult};

#[derive(Debug, Clone)]
struct LockRow {
    version: String,
    holder: Option<String>,
    touched_at: i64,
    written_at: i64,
    writer_server: String,
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    rows: Mutex<HashMap<String, LockRow>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holder of a row, for assertions
    pub fn holder(&self, key: &str) -> Option<String> {
        self.rows.lock().get(key).and_then(|r| r.holder.clone())
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

impl LockStore for MemoryLockStore {
    fn read_version(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.rows.lock().get(key).map(|r| r.version.clone()))
    }

    fn insert_version(&self, key: &str, version: &str, server_id: &str, now: i64) -> StoreResult<bool> {
        let mut rows = self.rows.lock();
        if rows.contains_key(key) {
            return Ok(false);
        }
        rows.insert(
            key.to_string(),
            LockRow {
                version: version.to_string(),
                holder: None,
                touched_at: now,
                written_at: now,
                writer_server: server_id.to_string(),
            },
        );
        Ok(true)
    }

    fn try_acquire(
        &self,
        key: &str,
        expected_version: &str,
        session_key: &str,
        now: i64,
        stale_before: i64,
    ) -> StoreResult<bool> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(key) else {
            return Ok(false);
        };
        let free = match &row.holder {
            None => true,
            Some(holder) => holder == session_key || row.touched_at < stale_before,
        };
        if row.version != expected_version || !free {
            return Ok(false);
        }
        row.holder = Some(session_key.to_string());
        row.touched_at = now;
        Ok(true)
    }

    fn write_version(
        &self,
        key: &str,
        session_key: &str,
        version: &str,
        server_id: &str,
        now: i64,
    ) -> StoreResult<bool> {
        let mut rows = self.rows.lock();
        match rows.get_mut(key) {
            Some(row) if row.holder.as_deref() == Some(session_key) => {
                row.version = version.to_string();
                row.touched_at = now;
                row.written_at = now;
                row.writer_server = server_id.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, session_key: &str) -> StoreResult<bool> {
        let mut rows = self.rows.lock();
        match rows.get_mut(key) {
            Some(row) if row.holder.as_deref() == Some(session_key) => {
                row.holder = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn touch(&self, keys: &[String], now: i64) -> StoreResult<()> {
        let mut rows = self.rows.lock();
        for key in keys {
            if let Some(row) = rows.get_mut(key) {
                row.touched_at = now;
            }
        }
        Ok(())
    }

    fn purge_untouched(&self, before: i64) -> StoreResult<usize> {
        let mut rows = self.rows.lock();
        let count = rows.len();
        rows.retain(|_, r| r.holder.is_some() || r.touched_at >= before);
        Ok(count - rows.len())
    }

    fn changed_since(&self, since: i64, exclude_server: &str) -> StoreResult<Vec<(String, String)>> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .filter(|(_, r)| r.written_at >= since && r.writer_server != exclude_server)
            .map(|(k, r)| (k.clone(), r.version.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_acquire() {
        let store = MemoryLockStore::new();
        assert!(store.insert_version("Customer|=5", "v1", "s1", 1_000).unwrap());
        assert!(!store.insert_version("Customer|=5", "v9", "s2", 1_000).unwrap());

        assert!(!store.try_acquire("Customer|=5", "v0", "a", 2_000, 0).unwrap());
        assert!(store.try_acquire("Customer|=5", "v1", "a", 2_000, 0).unwrap());
        assert!(!store.try_acquire("Customer|=5", "v1", "b", 2_000, 0).unwrap());
        assert!(store.try_acquire("Customer|=5", "v1", "a", 2_500, 0).unwrap());

        // b may reclaim once a's hold is older than the stale cutoff
        assert!(store.try_acquire("Customer|=5", "v1", "b", 9_000, 3_000).unwrap());
        assert_eq!(store.holder("Customer|=5").as_deref(), Some("b"));
    }

    #[test]
    fn test_write_and_changes() {
        let store = MemoryLockStore::new();
        store.insert_version("k", "v1", "s1", 1_000).unwrap();
        assert!(!store.write_version("k", "a", "v2", "s1", 2_000).unwrap());

        store.try_acquire("k", "v1", "a", 2_000, 0).unwrap();
        assert!(store.write_version("k", "a", "v2", "s1", 3_000).unwrap());
        assert_eq!(store.read_version("k").unwrap().as_deref(), Some("v2"));

        assert!(store.changed_since(2_500, "s1").unwrap().is_empty());
        assert_eq!(
            store.changed_since(2_500, "s2").unwrap(),
            vec![("k".to_string(), "v2".to_string())]
        );
        assert!(store.changed_since(3_001, "s2").unwrap().is_empty());
    }

    #[test]
    fn test_purge_keeps_held_rows() {
        let store = MemoryLockStore::new();
        store.insert_version("old", "v1", "s", 1_000).unwrap();
        store.insert_version("held", "v1", "s", 1_000).unwrap();
        store.try_acquire("held", "v1", "a", 1_000, 0).unwrap();

        assert_eq!(store.purge_untouched(5_000).unwrap(), 1);
        assert_eq!(store.row_count(), 1);
        assert!(store.release("held", "a").unwrap());
        assert!(!store.release("held", "a").unwrap());
    }
}
