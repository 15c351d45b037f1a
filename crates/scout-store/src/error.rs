//! Error types for the store.

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A previous holder of the connection panicked.
    #[error("store connection lock poisoned")]
    LockPoisoned,

    /// Row not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// A field failed validation.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// A profile with the same URL is already tracked.
    #[error("profile already tracked: {0}")]
    DuplicateProfile(String),
}
