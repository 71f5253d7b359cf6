//! Store error types
//!
//! Every failure of the storage layer, whatever the backend, ends up as one
//! of these variants.

use thiserror::Error;

/// Errors that can occur while talking to the sample store
#[derive(Error, Debug)]
pub enum StorageError {
    /// Could not open or authenticate a connection
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A statement was rejected by the database
    #[error("Statement failed: {0}")]
    Statement(String),

    /// Beginning or committing the transaction failed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Table name is not a plain SQL identifier
    #[error("Invalid table name: {0:?}")]
    InvalidTable(String),

    /// Character set is not a plain identifier
    #[error("Invalid charset: {0:?}")]
    InvalidCharset(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Statement(err.to_string())
    }
}

impl From<mysql::Error> for StorageError {
    fn from(err: mysql::Error) -> Self {
        StorageError::Statement(err.to_string())
    }
}

impl From<postgres::Error> for StorageError {
    fn from(err: postgres::Error) -> Self {
        StorageError::Statement(err.to_string())
    }
}

/// Result type alias for store operations
pub type StorageResult<T> = Result<T, StorageError>;
