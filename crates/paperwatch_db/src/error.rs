//! Error types for the state store.

use thiserror::Error;

/// State store operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// State store errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, transaction)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (creating the database directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write attempted through a read-only handle
    #[error("Operation requires write access but the store was opened read-only")]
    ReadOnly,

    /// Schema or state the store cannot work with
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}
