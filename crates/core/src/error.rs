//! Error types for replicore
//!
//! This module defines the error taxonomy shared by every crate in the
//! workspace. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.

use crate::types::TransactionId;
use std::io;
use thiserror::Error;

/// Result type alias for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Error types for the replication applier
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// An event in a write-set buffer could not be decoded
    ///
    /// Fatal for the whole write-set: nothing after the bad event is
    /// decoded.
    #[error("Malformed event: {reason} (data_len={data_len}, type_code={type_code:?})")]
    MalformedEvent {
        /// What was wrong
        reason: String,
        /// Declared length of the bad event, or the bytes left when even
        /// the common header is truncated
        data_len: usize,
        /// Type code from the header, if it could be read
        type_code: Option<u8>,
    },

    /// Executing a decoded event against storage failed
    #[error("Could not execute {event_type} event #{event_index}: {message} (error code {code})")]
    ApplyFailure {
        /// Storage error code
        code: u32,
        /// 1-based index of the failed event among executed events
        event_index: usize,
        /// Human readable event kind
        event_type: &'static str,
        /// Storage error message
        message: String,
    },

    /// Certification failed for a transaction
    #[error("Certification conflict for transaction {0}")]
    CertificationConflict(TransactionId),

    /// State that should be impossible was observed; callers treat as fatal
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// A session was pushed twice onto an abort queue
    #[error("Duplicate abort request for session {0}")]
    DuplicateAbortRequest(u64),

    /// Operation not valid in the current transaction state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage layer error
    #[error("Storage error {code}: {message}")]
    Storage {
        /// Storage error code
        code: u32,
        /// Message
        message: String,
    },

    /// The replication provider reported a failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (dump files, checkpoints, thread spawn)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ReplicationError {
    /// Build a malformed event error
    pub fn malformed(reason: impl Into<String>, data_len: usize, type_code: Option<u8>) -> Self {
        ReplicationError::MalformedEvent {
            reason: reason.into(),
            data_len,
            type_code,
        }
    }

    /// True for errors after which the node cannot continue applying
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::InternalInconsistency(_) | ReplicationError::Provider(_)
        )
    }

    /// Storage error code, if any
    pub fn code(&self) -> Option<u32> {
        match self {
            ReplicationError::ApplyFailure { code, .. } => Some(*code),
            ReplicationError::Storage { code, .. } => Some(*code),
            _ => None,
        }
    }
}
