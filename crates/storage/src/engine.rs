//! MemoryEngine: in-memory transactional table store
//!
//! Tables are ordered maps from primary key (first column) to row. Writes
//! are buffered per transaction and made visible atomically at commit.
//! Every written row is protected by an exclusive row lock held until the
//! transaction ends.
//!
//! # Write modes
//!
//! - strict: duplicate inserts and updates/deletes of missing rows fail
//! - idempotent: duplicate inserts replace the row, missing rows are
//!   skipped; both are reported as [`WriteOutcome::Ignored`]
//! - `unique_checks = false`: duplicate inserts overwrite silently
//!
//! Schema changes are not transactional and apply immediately.

use crate::error::{StorageError, StorageResult, ER_DUP_ENTRY, ER_KEY_NOT_FOUND};
use crate::locks::{ConflictHandler, RowLockTable, StorageTrx};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use replicore_core::{Row, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Ordered rows of one table
pub type TableRows = BTreeMap<Value, Row>;

/// Per-transaction options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrxOptions {
    /// Conflicts with other transactions are reported to the conflict handler
    pub high_priority: bool,
    /// Tolerate duplicate and missing rows
    pub idempotent: bool,
    /// Check primary key uniqueness on insert
    pub unique_checks: bool,
}

impl Default for TrxOptions {
    fn default() -> Self {
        Self {
            high_priority: false,
            idempotent: false,
            unique_checks: true,
        }
    }
}

impl TrxOptions {
    /// Options for a high-priority (applier) transaction
    pub fn high_priority() -> Self {
        Self {
            high_priority: true,
            ..Self::default()
        }
    }
}

/// Result of a single row write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write took effect
    Applied,
    /// An error was tolerated in idempotent mode
    Ignored {
        /// Error code that was tolerated
        code: u32,
        /// Message of the tolerated error
        message: String,
    },
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Changes became visible
    Committed,
    /// Changes were discarded
    RolledBack,
}

/// One entry of the engine journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Transaction
    pub trx: StorageTrx,
    /// Outcome
    pub outcome: Outcome,
    /// Committed changes were written to the change log
    pub logged: bool,
    /// Rows changed
    pub changes: usize,
    /// Transaction ran with high priority
    pub high_priority: bool,
    /// When the transaction ended
    pub at: DateTime<Utc>,
}

struct ActiveTrx {
    options: TrxOptions,
    /// Final image per row, `None` for deleted
    writes: BTreeMap<(String, Value), Option<Row>>,
}

/// In-memory transactional engine
pub struct MemoryEngine {
    tables: DashMap<String, TableRows>,
    active: DashMap<StorageTrx, ActiveTrx>,
    locks: RowLockTable,
    next_trx: AtomicU64,
    history: Mutex<Vec<HistoryEntry>>,
}

impl MemoryEngine {
    /// Empty engine whose row lock waits give up after `lock_wait_timeout`
    pub fn new(lock_wait_timeout: Duration) -> Self {
        Self {
            tables: DashMap::new(),
            active: DashMap::new(),
            locks: RowLockTable::new(lock_wait_timeout),
            next_trx: AtomicU64::new(1),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Engine pre-populated with `tables`
    pub fn with_tables(
        lock_wait_timeout: Duration,
        tables: impl IntoIterator<Item = (String, TableRows)>,
    ) -> Self {
        let engine = Self::new(lock_wait_timeout);
        for (name, rows) in tables {
            engine.tables.insert(name, rows);
        }
        engine
    }

    /// Install the conflict handler used for high-priority lock conflicts
    pub fn set_conflict_handler(&self, handler: Arc<dyn ConflictHandler>) {
        self.locks.set_conflict_handler(handler);
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Create a table
    pub fn create_table(&self, name: &str, if_not_exists: bool) -> StorageResult<()> {
        if self.tables.contains_key(name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(StorageError::TableExists(name.to_string()));
        }
        self.tables.insert(name.to_string(), TableRows::new());
        debug!(target: "replicore::storage", table = name, "created table");
        Ok(())
    }

    /// Drop a table
    pub fn drop_table(&self, name: &str, if_exists: bool) -> StorageResult<()> {
        if self.tables.remove(name).is_none() && !if_exists {
            return Err(StorageError::NoSuchTable(name.to_string()));
        }
        debug!(target: "replicore::storage", table = name, "dropped table");
        Ok(())
    }

    /// True if the table exists
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Names of all tables, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Start a transaction
    pub fn begin(&self, options: TrxOptions) -> StorageTrx {
        let trx = self.next_trx.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            trx,
            ActiveTrx {
                options,
                writes: BTreeMap::new(),
            },
        );
        trace!(target: "replicore::storage", trx, high_priority = options.high_priority, "begin");
        trx
    }

    /// True while `trx` is open
    pub fn is_active(&self, trx: StorageTrx) -> bool {
        self.active.contains_key(&trx)
    }

    /// Number of buffered row changes of `trx`
    pub fn pending_changes(&self, trx: StorageTrx) -> usize {
        self.active.get(&trx).map_or(0, |a| a.writes.len())
    }

    fn options(&self, trx: StorageTrx) -> StorageResult<TrxOptions> {
        self.active
            .get(&trx)
            .map(|a| a.options)
            .ok_or(StorageError::UnknownTransaction(trx))
    }

    /// Row as seen by `trx`: its own writes over committed state
    fn visible(&self, trx: StorageTrx, table: &str, key: &Value) -> StorageResult<Option<Row>> {
        if let Some(active) = self.active.get(&trx) {
            if let Some(image) = active.writes.get(&(table.to_string(), key.clone())) {
                return Ok(image.clone());
            }
        }
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| StorageError::NoSuchTable(table.to_string()))?;
        Ok(rows.get(key).cloned())
    }

    fn buffer(&self, trx: StorageTrx, table: &str, key: Value, image: Option<Row>) -> StorageResult<()> {
        let mut active = self
            .active
            .get_mut(&trx)
            .ok_or(StorageError::UnknownTransaction(trx))?;
        active.writes.insert((table.to_string(), key), image);
        Ok(())
    }

    fn lock_row(&self, trx: StorageTrx, table: &str, key: &Value, options: TrxOptions) -> StorageResult<()> {
        if !self.tables.contains_key(table) {
            return Err(StorageError::NoSuchTable(table.to_string()));
        }
        self.locks.acquire(trx, table, key, options.high_priority)
    }

    /// Insert a row
    pub fn insert(&self, trx: StorageTrx, table: &str, row: Row) -> StorageResult<WriteOutcome> {
        let options = self.options(trx)?;
        let key = primary_key(&row);
        self.lock_row(trx, table, &key, options)?;

        let mut outcome = WriteOutcome::Applied;
        if self.visible(trx, table, &key)?.is_some() {
            let err = StorageError::DuplicateKey {
                table: table.to_string(),
                key: key.to_string(),
            };
            if options.idempotent {
                outcome = WriteOutcome::Ignored {
                    code: ER_DUP_ENTRY,
                    message: err.to_string(),
                };
            } else if options.unique_checks {
                return Err(err);
            }
        }
        self.buffer(trx, table, key, Some(row))?;
        Ok(outcome)
    }

    /// Replace the row identified by `before` with `after`
    pub fn update(&self, trx: StorageTrx, table: &str, before: &Row, after: Row) -> StorageResult<WriteOutcome> {
        let options = self.options(trx)?;
        let old_key = primary_key(before);
        let new_key = primary_key(&after);
        self.lock_row(trx, table, &old_key, options)?;

        if self.visible(trx, table, &old_key)?.is_none() {
            let err = StorageError::KeyNotFound {
                table: table.to_string(),
                key: old_key.to_string(),
            };
            if options.idempotent {
                return Ok(WriteOutcome::Ignored {
                    code: ER_KEY_NOT_FOUND,
                    message: err.to_string(),
                });
            }
            return Err(err);
        }

        if new_key != old_key {
            self.lock_row(trx, table, &new_key, options)?;
            if self.visible(trx, table, &new_key)?.is_some() && !options.idempotent {
                return Err(StorageError::DuplicateKey {
                    table: table.to_string(),
                    key: new_key.to_string(),
                });
            }
            self.buffer(trx, table, old_key, None)?;
        }
        self.buffer(trx, table, new_key, Some(after))?;
        Ok(WriteOutcome::Applied)
    }

    /// Delete the row identified by `row`
    pub fn delete(&self, trx: StorageTrx, table: &str, row: &Row) -> StorageResult<WriteOutcome> {
        let options = self.options(trx)?;
        let key = primary_key(row);
        self.lock_row(trx, table, &key, options)?;

        if self.visible(trx, table, &key)?.is_none() {
            let err = StorageError::KeyNotFound {
                table: table.to_string(),
                key: key.to_string(),
            };
            if options.idempotent {
                return Ok(WriteOutcome::Ignored {
                    code: ER_KEY_NOT_FOUND,
                    message: err.to_string(),
                });
            }
            return Err(err);
        }
        self.buffer(trx, table, key, None)?;
        Ok(WriteOutcome::Applied)
    }

    /// Read a row; with `trx` the transaction's own writes are visible
    pub fn get(&self, trx: Option<StorageTrx>, table: &str, key: &Value) -> StorageResult<Option<Row>> {
        match trx {
            Some(trx) => self.visible(trx, table, key),
            None => {
                let rows = self
                    .tables
                    .get(table)
                    .ok_or_else(|| StorageError::NoSuchTable(table.to_string()))?;
                Ok(rows.get(key).cloned())
            }
        }
    }

    /// Committed rows of a table in key order
    pub fn scan(&self, table: &str) -> StorageResult<Vec<Row>> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| StorageError::NoSuchTable(table.to_string()))?;
        Ok(rows.values().cloned().collect())
    }

    /// Committed rows whose text key starts with `prefix`, in key order
    pub fn scan_prefix(&self, table: &str, prefix: &str) -> StorageResult<Vec<Row>> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| StorageError::NoSuchTable(table.to_string()))?;
        let start = Value::Text(prefix.to_string());
        Ok(rows
            .range(start..)
            .take_while(|(k, _)| matches!(k, Value::Text(s) if s.starts_with(prefix)))
            .map(|(_, row)| row.clone())
            .collect())
    }

    /// Make the writes of `trx` visible and release its locks
    ///
    /// `logged` records whether the commit went to the change log.
    pub fn commit(&self, trx: StorageTrx, logged: bool) -> StorageResult<usize> {
        let (_, active) = self
            .active
            .remove(&trx)
            .ok_or(StorageError::UnknownTransaction(trx))?;

        let changes = active.writes.len();
        for ((table, key), image) in active.writes {
            // a concurrent drop discards the write
            if let Some(mut rows) = self.tables.get_mut(&table) {
                match image {
                    Some(row) => {
                        rows.insert(key, row);
                    }
                    None => {
                        rows.remove(&key);
                    }
                }
            }
        }
        self.locks.release_all(trx);
        self.record(trx, Outcome::Committed, logged, changes, active.options.high_priority);
        debug!(target: "replicore::storage", trx, changes, logged, "commit");
        Ok(changes)
    }

    /// Discard the writes of `trx` and release its locks
    ///
    /// Rolling back an unknown transaction is a no-op.
    pub fn rollback(&self, trx: StorageTrx) {
        if let Some((_, active)) = self.active.remove(&trx) {
            let changes = active.writes.len();
            self.locks.release_all(trx);
            self.record(trx, Outcome::RolledBack, false, changes, active.options.high_priority);
            debug!(target: "replicore::storage", trx, changes, "rollback");
        }
    }

    /// Break a row lock wait of `trx`; the waiter fails with a deadlock error
    pub fn cancel_lock_wait(&self, trx: StorageTrx) -> bool {
        self.locks.cancel_wait(trx)
    }

    /// True if `trx` waits for a row lock
    pub fn is_waiting(&self, trx: StorageTrx) -> bool {
        self.locks.is_waiting(trx)
    }

    /// Holder of the lock on a row
    pub fn lock_holder(&self, table: &str, key: &Value) -> Option<StorageTrx> {
        self.locks.holder(table, key)
    }

    fn record(&self, trx: StorageTrx, outcome: Outcome, logged: bool, changes: usize, high_priority: bool) {
        self.history.lock().push(HistoryEntry {
            trx,
            outcome,
            logged,
            changes,
            high_priority,
            at: Utc::now(),
        });
    }

    /// Journal of ended transactions, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().clone()
    }

    /// Copy of every table
    pub fn snapshot(&self) -> BTreeMap<String, TableRows> {
        self.tables
            .iter()
            .map(|t| (t.key().clone(), t.value().clone()))
            .collect()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("tables", &self.tables.len())
            .field("active", &self.active.len())
            .field("locks", &self.locks)
            .finish()
    }
}

/// Primary key of a row (first column, NULL for an empty row)
pub fn primary_key(row: &Row) -> Value {
    row.first().cloned().unwrap_or(Value::Null)
}
