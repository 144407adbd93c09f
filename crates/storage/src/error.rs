//! Storage error types

use replicore_core::ReplicationError;
use std::io;
use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Error code: duplicate key
pub const ER_DUP_ENTRY: u32 = 1062;
/// Error code: row not found
pub const ER_KEY_NOT_FOUND: u32 = 1032;
/// Error code: lock wait timeout
pub const ER_LOCK_WAIT_TIMEOUT: u32 = 1205;
/// Error code: deadlock, transaction must be rolled back
pub const ER_LOCK_DEADLOCK: u32 = 1213;
/// Error code: table does not exist
pub const ER_NO_SUCH_TABLE: u32 = 1146;
/// Error code: table already exists
pub const ER_TABLE_EXISTS: u32 = 1050;
/// Error code: anything else
pub const ER_UNKNOWN: u32 = 1105;

/// Errors raised by the storage engine
#[derive(Debug, Error)]
pub enum StorageError {
    /// Insert hit an existing primary key
    #[error("Duplicate entry '{key}' for key 'PRIMARY' in table '{table}'")]
    DuplicateKey {
        /// Table name
        table: String,
        /// Rendered key
        key: String,
    },

    /// Update or delete target is missing
    #[error("Can't find record '{key}' in table '{table}'")]
    KeyNotFound {
        /// Table name
        table: String,
        /// Rendered key
        key: String,
    },

    /// Row lock wait exceeded the configured timeout
    #[error("Lock wait timeout exceeded; try restarting transaction")]
    LockWaitTimeout,

    /// Lock wait was broken to resolve a conflict
    #[error("Deadlock found when trying to get lock; try restarting transaction")]
    Deadlock,

    /// Table is missing
    #[error("Table '{0}' doesn't exist")]
    NoSuchTable(String),

    /// Table already exists
    #[error("Table '{0}' already exists")]
    TableExists(String),

    /// Transaction id is not active
    #[error("Unknown storage transaction {0}")]
    UnknownTransaction(u64),

    /// Checkpoint contents failed validation
    #[error("Corruption: {0}")]
    Corruption(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Numeric error code
    pub fn code(&self) -> u32 {
        match self {
            StorageError::DuplicateKey { .. } => ER_DUP_ENTRY,
            StorageError::KeyNotFound { .. } => ER_KEY_NOT_FOUND,
            StorageError::LockWaitTimeout => ER_LOCK_WAIT_TIMEOUT,
            StorageError::Deadlock => ER_LOCK_DEADLOCK,
            StorageError::NoSuchTable(_) => ER_NO_SUCH_TABLE,
            StorageError::TableExists(_) => ER_TABLE_EXISTS,
            _ => ER_UNKNOWN,
        }
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<StorageError> for ReplicationError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(io) => ReplicationError::Io(io),
            StorageError::Serialization(msg) => ReplicationError::Serialization(msg),
            other => ReplicationError::Storage {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let dup = StorageError::DuplicateKey {
            table: "t".into(),
            key: "1".into(),
        };
        assert_eq!(dup.code(), 1062);
        assert_eq!(StorageError::LockWaitTimeout.code(), 1205);
        assert_eq!(StorageError::Deadlock.code(), 1213);
        assert_eq!(StorageError::NoSuchTable("t".into()).code(), 1146);
        assert_eq!(StorageError::TableExists("t".into()).code(), 1050);
    }

    #[test]
    fn test_into_replication_error() {
        let err: ReplicationError = StorageError::Deadlock.into();
        match err {
            ReplicationError::Storage { code, message } => {
                assert_eq!(code, 1213);
                assert!(message.contains("Deadlock"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
