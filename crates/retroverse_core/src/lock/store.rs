//! Shared lock/version store abstraction.
//!
//! The store holds one row per record key with the current version, the
//! session holding the lock (if any), when the row was last touched and
//! written, and which server process wrote the current version. It is the
//! single source of truth across server processes; every operation must be
//! atomic on its own.

use crate::error::RetroError;

/// Result type for lock store operations.
pub type StoreResult<T> = Result<T, RetroError>;

/// Trait for shared lock store backends.
///
/// Times are Unix milliseconds supplied by the caller.
pub trait LockStore: Send + Sync {
    /// Current version of a record, `None` if the store has no row for it.
    fn read_version(&self, key: &str) -> StoreResult<Option<String>>;

    /// Create the row for a record with no holder.
    ///
    /// Returns `false` if a row already exists (a concurrent creator won).
    fn insert_version(&self, key: &str, version: &str, server_id: &str, now: i64)
    -> StoreResult<bool>;

    /// Compare-and-swap acquisition.
    ///
    /// Sets the holder to `session_key` only if the stored version equals
    /// `expected_version` and the row is unheld, already held by the same
    /// session, or was last touched before `stale_before`.
    fn try_acquire(
        &self,
        key: &str,
        expected_version: &str,
        session_key: &str,
        now: i64,
        stale_before: i64,
    ) -> StoreResult<bool>;

    /// Write a new version. Only succeeds while `session_key` holds the row.
    fn write_version(
        &self,
        key: &str,
        session_key: &str,
        version: &str,
        server_id: &str,
        now: i64,
    ) -> StoreResult<bool>;

    /// Clear the holder if it is `session_key`.
    fn release(&self, key: &str, session_key: &str) -> StoreResult<bool>;

    /// Refresh the touch time of held rows (heartbeat).
    fn touch(&self, keys: &[String], now: i64) -> StoreResult<()>;

    /// Delete unheld rows last touched before `before`.
    fn purge_untouched(&self, before: i64) -> StoreResult<usize>;

    /// `(key, version)` of rows written at or after `since` by any server
    /// other than `exclude_server`.
    fn changed_since(&self, since: i64, exclude_server: &str)
    -> StoreResult<Vec<(String, String)>>;
}
