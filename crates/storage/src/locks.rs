//! Row lock table
//!
//! Exclusive row locks held until the owning transaction ends. Waiters
//! sleep on a single condvar with a deadline; a wait can be broken from the
//! outside with [`RowLockTable::cancel_wait`], which makes the waiter fail
//! with [`StorageError::Deadlock`].
//!
//! When a high-priority transaction finds a row held by someone else the
//! table calls the installed [`ConflictHandler`] once per holder, with the
//! table mutex released, before it starts waiting.

use crate::error::{StorageError, StorageResult};
use parking_lot::{Condvar, Mutex, RwLock};
use replicore_core::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Storage transaction id
pub type StorageTrx = u64;

/// Receives lock conflicts raised by high-priority transactions
pub trait ConflictHandler: Send + Sync {
    /// `requester` is blocked by a row lock held by `holder`
    fn on_lock_conflict(&self, requester: StorageTrx, holder: StorageTrx);
}

type RowKey = (String, Value);

#[derive(Default)]
struct LockState {
    holders: FxHashMap<RowKey, StorageTrx>,
    held_by: FxHashMap<StorageTrx, SmallVec<[RowKey; 4]>>,
    waiting: FxHashSet<StorageTrx>,
    cancelled: FxHashSet<StorageTrx>,
}

/// Exclusive row locks with breakable waits
pub struct RowLockTable {
    state: Mutex<LockState>,
    released: Condvar,
    handler: RwLock<Option<Arc<dyn ConflictHandler>>>,
    timeout: Duration,
}

impl RowLockTable {
    /// Lock table whose waits give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            handler: RwLock::new(None),
            timeout,
        }
    }

    /// Install the conflict handler
    pub fn set_conflict_handler(&self, handler: Arc<dyn ConflictHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Acquire the row lock on `(table, key)` for `trx`
    ///
    /// Re-acquiring a held lock is a no-op. `high_priority` requesters
    /// report each distinct holder to the conflict handler before waiting.
    pub fn acquire(
        &self,
        trx: StorageTrx,
        table: &str,
        key: &Value,
        high_priority: bool,
    ) -> StorageResult<()> {
        let row: RowKey = (table.to_string(), key.clone());
        let deadline = Instant::now() + self.timeout;
        let mut reported: SmallVec<[StorageTrx; 2]> = SmallVec::new();

        let mut state = self.state.lock();
        loop {
            if state.cancelled.remove(&trx) {
                state.waiting.remove(&trx);
                debug!(target: "replicore::storage", trx, table, "lock wait cancelled");
                return Err(StorageError::Deadlock);
            }

            let holder = match state.holders.get(&row) {
                None => {
                    state.holders.insert(row.clone(), trx);
                    state.held_by.entry(trx).or_default().push(row);
                    state.waiting.remove(&trx);
                    return Ok(());
                }
                Some(&holder) if holder == trx => {
                    state.waiting.remove(&trx);
                    return Ok(());
                }
                Some(&holder) => holder,
            };

            if high_priority && !reported.contains(&holder) {
                reported.push(holder);
                let handler = self.handler.read().clone();
                if let Some(handler) = handler {
                    // waiting is visible before the handler runs so it can break us
                    state.waiting.insert(trx);
                    drop(state);
                    handler.on_lock_conflict(trx, holder);
                    state = self.state.lock();
                    continue;
                }
            }

            state.waiting.insert(trx);
            if self.released.wait_until(&mut state, deadline).timed_out() {
                state.waiting.remove(&trx);
                state.cancelled.remove(&trx);
                return Err(StorageError::LockWaitTimeout);
            }
        }
    }

    /// Release every lock held by `trx`
    pub fn release_all(&self, trx: StorageTrx) {
        let mut state = self.state.lock();
        if let Some(rows) = state.held_by.remove(&trx) {
            for row in rows {
                state.holders.remove(&row);
            }
        }
        state.waiting.remove(&trx);
        state.cancelled.remove(&trx);
        drop(state);
        self.released.notify_all();
    }

    /// Break the lock wait of `trx`, if it is waiting
    ///
    /// Returns true if a wait was broken.
    pub fn cancel_wait(&self, trx: StorageTrx) -> bool {
        let mut state = self.state.lock();
        if !state.waiting.contains(&trx) {
            return false;
        }
        state.cancelled.insert(trx);
        drop(state);
        self.released.notify_all();
        true
    }

    /// Current holder of a row lock
    pub fn holder(&self, table: &str, key: &Value) -> Option<StorageTrx> {
        self.state
            .lock()
            .holders
            .get(&(table.to_string(), key.clone()))
            .copied()
    }

    /// Number of locks held by `trx`
    pub fn held_count(&self, trx: StorageTrx) -> usize {
        self.state.lock().held_by.get(&trx).map_or(0, |rows| rows.len())
    }

    /// True if `trx` is blocked on a row lock
    pub fn is_waiting(&self, trx: StorageTrx) -> bool {
        self.state.lock().waiting.contains(&trx)
    }
}

impl std::fmt::Debug for RowLockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RowLockTable")
            .field("held", &state.holders.len())
            .field("waiting", &state.waiting.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
