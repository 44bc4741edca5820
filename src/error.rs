//! Error types for scoped SQLite access

use thiserror::Error;

/// Errors raised by the scope scheduler, the predicate compiler and the engine
#[derive(Error, Debug)]
pub enum SqliteError {
    /// `start()` was called on a scope that had already been started
    #[error("scope {0} has already been started")]
    ScopeAlreadyStarted(u64),

    /// An operation referenced a scope that has already ended
    #[error("scope {0} has already ended")]
    ScopeEnded(u64),

    /// A scope was requested after the scheduler was closed
    #[error("scope scheduler is closed")]
    SchedulerClosed,

    /// The where-expression has a shape the compiler cannot accept
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    /// A table or column name is not a plain SQL identifier
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// An initializer registered on the database failed
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Invalid operation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Database connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Underlying rusqlite error
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// Result type for scoped SQLite operations
pub type SqliteResult<T> = Result<T, SqliteError>;

impl From<tokio::task::JoinError> for SqliteError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Connection(format!("engine task failed: {}", err))
    }
}
