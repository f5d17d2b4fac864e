//! Custom error types for the common library
//!
//! This module defines the storage error type shared by every repository
//! implementation, whether it is backed by PostgreSQL or kept in memory.

use sqlx::Error as SqlxError;
use thiserror::Error;

/// Custom error type for database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error occurred during database connection
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    /// Error occurred during database query execution
    #[error("Database query error: {0}")]
    Query(#[source] SqlxError),

    /// A unique constraint rejected the write
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A write touched a different number of rows than expected
    #[error("Unexpected effect: {affected} rows affected, expected {expected}")]
    UnexpectedEffect { affected: u64, expected: u64 },

    /// A stored value could not be mapped back into its domain type
    #[error("Database decode error: {0}")]
    Decode(String),

    /// The transaction was already committed or rolled back
    #[error("Transaction already finished")]
    TransactionClosed,

    /// Error occurred during database migration
    #[error("Database migration error: {0}")]
    Migration(String),

    /// Configuration error
    #[error("Database configuration error: {0}")]
    Configuration(String),
}

impl DatabaseError {
    /// Classify a query failure, singling out unique constraint violations
    pub fn from_query(error: SqlxError) -> Self {
        match &error {
            SqlxError::Database(db) if db.is_unique_violation() => {
                DatabaseError::UniqueViolation(db.constraint().unwrap_or("unknown").to_string())
            }
            _ => DatabaseError::Query(error),
        }
    }

    /// Check that a write affected exactly `expected` rows
    pub fn expect_affected(affected: u64, expected: u64) -> DatabaseResult<()> {
        if affected == expected {
            Ok(())
        } else {
            Err(DatabaseError::UnexpectedEffect { affected, expected })
        }
    }

    /// Whether retrying the enclosing transaction may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, DatabaseError::UniqueViolation(_))
    }
}

/// Type alias for Result with DatabaseError
pub type DatabaseResult<T> = Result<T, DatabaseError>;
