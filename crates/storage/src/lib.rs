//! Storage layer for replicore
//!
//! This crate implements the storage collaborators of the applier:
//! - MemoryEngine: transactional tables with buffered writes and row locks
//! - RowLockTable: exclusive row locks with breakable waits and a conflict hook
//! - StreamingLog: fragment side-table for streaming transactions
//! - Checkpoint files (rmp-serde image with CRC)
//! - CacheTable: bucket-partitioned pin/unpin with nonblocking pins

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cachetable;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod locks;
pub mod streaming_log;

pub use cachetable::{
    BlockNum, CacheStats, CacheTable, FileId, PinMode, PinOutcome, PinnedPair, Unlocker,
};
pub use engine::{
    primary_key, HistoryEntry, MemoryEngine, Outcome, TableRows, TrxOptions, WriteOutcome,
};
pub use error::{
    StorageError, StorageResult, ER_DUP_ENTRY, ER_KEY_NOT_FOUND, ER_LOCK_DEADLOCK,
    ER_LOCK_WAIT_TIMEOUT, ER_NO_SUCH_TABLE, ER_TABLE_EXISTS, ER_UNKNOWN,
};
pub use locks::{ConflictHandler, RowLockTable, StorageTrx};
pub use streaming_log::{Fragment, RecoveredFragments, StreamingLog, STREAMING_LOG_TABLE};

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(MemoryEngine: Send, Sync);
    static_assertions::assert_impl_all!(StreamingLog: Send, Sync);
    static_assertions::assert_impl_all!(CacheTable<Vec<u8>>: Send, Sync);
}
