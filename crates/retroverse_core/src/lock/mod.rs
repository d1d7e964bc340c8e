//! Cross-server optimistic locking and version assignment.

mod manager;
mod memory_store;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_store;
mod store;

pub use manager::{LockManager, LockState};
pub use memory_store::MemoryLockStore;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_store::SqliteLockStore;
pub use store::{LockStore, StoreResult};
