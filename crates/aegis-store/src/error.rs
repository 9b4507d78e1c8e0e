//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur at the database boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration file could not be loaded or merged.
    #[error("failed to load store config {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: config::ConfigError,
    },

    /// Configuration loaded but failed validation.
    #[error("invalid store config {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },
}

impl StoreError {
    /// Returns true if the error is a unique-key conflict, which the
    /// bookkeeping log treats as an optimistic-concurrency failure.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}
