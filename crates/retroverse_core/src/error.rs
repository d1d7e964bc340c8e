use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for retroverse operations
#[derive(Debug, Error)]
pub enum RetroError {
    // Key errors
    #[error("Malformed key '{0}'")]
    MalformedKey(String),

    #[error("No daton type named '{0}'")]
    UnknownType(String),

    // Session errors
    #[error("Unknown session")]
    BadSession,

    // Diff errors
    #[error("Diff does not fit record '{key}': {reason}")]
    DiffShape { key: String, reason: String },

    #[error("Invalid wire data: {0}")]
    Wire(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Storage errors
    #[error("Lock store error: {0}")]
    LockStore(String),

    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Data service error: {0}")]
    Data(String),
}

impl RetroError {
    /// Wire error code this error is reported as when it aborts a request.
    pub fn code(&self) -> ErrorCode {
        match self {
            RetroError::BadSession => ErrorCode::BadSession,
            _ => ErrorCode::Internal,
        }
    }
}

/// Result type alias for retroverse operations
pub type Result<T> = std::result::Result<T, RetroError>;

/// Error codes that travel on the wire.
///
/// `BadSession` and `Internal` abort a whole request. `Locked` and
/// `VersionConflict` are reported per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    BadSession,
    Locked,
    VersionConflict,
    Internal,
}

impl ErrorCode {
    /// Human readable text attached to failed save items
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::BadSession => "Session is not known to the server",
            ErrorCode::Locked => "Record is locked by another user",
            ErrorCode::VersionConflict => "Record was changed by another user",
            ErrorCode::Internal => "Internal server error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}
