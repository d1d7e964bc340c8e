//! Retroverse core
//!
//! Synchronization and concurrency control for hierarchical, versioned data
//! objects ("datons") shared by many client sessions across a fleet of
//! server processes.
//!
//! ## Components
//!
//! - [`DatonKey`]: record and query keys with a canonical string form
//! - [`DatonCache`]: process-local cache pinned by subscriptions
//! - [`ClientPlex`]: sessions, subscriptions and long-poll push queues
//! - [`LockManager`]: optimistic locks and versions backed by a shared [`LockStore`]
//! - [`PersistonDiff`]: row-level diffs of persistons
//! - [`Retroverse`]: the orchestrator tying them to a [`DataService`]

/// Daton cache
pub mod cache;

/// Client sessions and push queues
pub mod clientplex;

/// Timing configuration
pub mod config;

/// Data service contract and the in-memory implementation
pub mod data;

/// Daton trees
pub mod daton;

/// Persiston diffs
pub mod diff;

/// Error (common error types)
pub mod error;

/// Daton keys
pub mod key;

/// Optimistic locking
pub mod lock;

/// Permission levels and resolution
pub mod permissions;

/// Endpoint request and response bodies
pub mod protocol;

/// The orchestrator
pub mod retroverse;

/// Schema catalog
pub mod schema;

pub mod util;

/// Field validation
pub mod validate;

/// Condensed daton encoding
pub mod wire;

pub use cache::DatonCache;
pub use clientplex::{ClientPlex, PushItems};
pub use config::RetroverseConfig;
pub use data::{DataService, DataTransaction, MemoryDataService};
pub use daton::{Daton, Row};
pub use diff::{ApplyResult, DiffRow, DiffTable, PersistonDiff};
pub use error::{ErrorCode, Result, RetroError};
pub use key::DatonKey;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use lock::SqliteLockStore;
pub use lock::{LockManager, LockState, LockStore, MemoryLockStore};
pub use permissions::{AllowAll, PermissionLevel, PermissionResolver, User};
pub use retroverse::{Retroverse, SaveOutcome};
pub use schema::{ColDef, ColType, DataDictionary, DatonDef, TableDef};
pub use validate::{SchemaValidator, Validator};
pub use wire::{CondensedDaton, RowFormat};
