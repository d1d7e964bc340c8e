//! SQLite-backed lock store.
//!
//! Every server process of a fleet opens the same database file; SQLite's
//! own locking makes each statement atomic across processes.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::store::{LockStore, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS retro_lock (
    daton_key TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    lock_session TEXT,
    touched_at INTEGER NOT NULL,
    written_at INTEGER NOT NULL,
    writer_server TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_retro_lock_written ON retro_lock(written_at);
CREATE INDEX IF NOT EXISTS idx_retro_lock_touched ON retro_lock(touched_at);
"#;

/// SQLite lock store.
///
/// The connection is wrapped in a `Mutex`; SQLite is used in serialized
/// threading mode.
pub struct SqliteLockStore {
    conn: Mutex<Connection>,
}

impl SqliteLockStore {
    /// Open or create the store at `path`, creating the table if needed
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// In-memory database for tests. Data is lost when the store is dropped.
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LockStore for SqliteLockStore {
    fn read_version(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT version FROM retro_lock WHERE daton_key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn insert_version(&self, key: &str, version: &str, server_id: &str, now: i64) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO retro_lock (daton_key, version, lock_session, touched_at, written_at, writer_server)
             VALUES (?, ?, NULL, ?, ?, ?)",
            params![key, version, now, now, server_id],
        )?;
        Ok(inserted == 1)
    }

    fn try_acquire(
        &self,
        key: &str,
        expected_version: &str,
        session_key: &str,
        now: i64,
        stale_before: i64,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE retro_lock SET lock_session = ?1, touched_at = ?2
             WHERE daton_key = ?3 AND version = ?4
               AND (lock_session IS NULL OR lock_session = ?1 OR touched_at < ?5)",
            params![session_key, now, key, expected_version, stale_before],
        )?;
        Ok(updated == 1)
    }

    fn write_version(
        &self,
        key: &str,
        session_key: &str,
        version: &str,
        server_id: &str,
        now: i64,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE retro_lock SET version = ?1, touched_at = ?2, written_at = ?2, writer_server = ?3
             WHERE daton_key = ?4 AND lock_session = ?5",
            params![version, now, server_id, key, session_key],
        )?;
        Ok(updated == 1)
    }

    fn release(&self, key: &str, session_key: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE retro_lock SET lock_session = NULL WHERE daton_key = ? AND lock_session = ?",
            params![key, session_key],
        )?;
        Ok(updated == 1)
    }

    fn touch(&self, keys: &[String], now: i64) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE retro_lock SET touched_at = ? WHERE daton_key = ?")?;
            for key in keys {
                stmt.execute(params![now, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn purge_untouched(&self, before: i64) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM retro_lock WHERE lock_session IS NULL AND touched_at < ?",
            [before],
        )?;
        Ok(deleted)
    }

    fn changed_since(&self, since: i64, exclude_server: &str) -> StoreResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT daton_key, version FROM retro_lock WHERE written_at >= ? AND writer_server <> ?",
        )?;
        let changes = stmt
            .query_map(params![since, exclude_server], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(changes)
    }
}
