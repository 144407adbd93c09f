//! Sessions
//!
//! A session is the per-connection (or per-applier) execution context. All
//! mutable state sits behind one `parking_lot::Mutex`; it is never held
//! across storage calls. The attribute group in [`SessionAttrs`] is what
//! the high-priority context shadows and restores.

use crate::mdl::MdlContext;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use replicore_core::{Diagnostics, FormatDescription};
use std::ops::{BitOr, BitOrAssign};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::debug;

/// Session option bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OptionBits(u64);

impl OptionBits {
    /// Statements are not written to the general log
    pub const LOG_OFF: OptionBits = OptionBits(1 << 0);
    /// Changes are written to the change log
    pub const BIN_LOG: OptionBits = OptionBits(1 << 1);
    /// Inside an explicit transaction
    pub const BEGIN: OptionBits = OptionBits(1 << 2);
    /// Skip primary key uniqueness checks
    pub const RELAXED_UNIQUE_CHECKS: OptionBits = OptionBits(1 << 3);
    /// Skip foreign key checks
    pub const NO_FOREIGN_KEY_CHECKS: OptionBits = OptionBits(1 << 4);
    /// Changes must not be replicated further
    pub const SKIP_REPLICATION: OptionBits = OptionBits(1 << 5);
    /// Explicit table locks are held
    pub const TABLE_LOCK: OptionBits = OptionBits(1 << 6);

    /// No bits
    pub const fn empty() -> Self {
        OptionBits(0)
    }

    /// True if every bit of `other` is set
    pub fn contains(&self, other: OptionBits) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set bits
    pub fn insert(&mut self, other: OptionBits) {
        self.0 |= other.0;
    }

    /// Clear bits
    pub fn remove(&mut self, other: OptionBits) {
        self.0 &= !other.0;
    }

    /// Set or clear bits
    pub fn set(&mut self, other: OptionBits, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for OptionBits {
    type Output = OptionBits;

    fn bitor(self, rhs: OptionBits) -> OptionBits {
        OptionBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for OptionBits {
    fn bitor_assign(&mut self, rhs: OptionBits) {
        self.0 |= rhs.0;
    }
}

/// Server status bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServerStatus(u32);

impl ServerStatus {
    /// A transaction is open
    pub const IN_TRANS: ServerStatus = ServerStatus(1 << 0);
    /// Autocommit mode
    pub const AUTOCOMMIT: ServerStatus = ServerStatus(1 << 1);

    /// True if every bit of `other` is set
    pub fn contains(&self, other: ServerStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set or clear bits
    pub fn set(&mut self, other: ServerStatus, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Dirty reads allowed
    ReadUncommitted,
    /// Only committed data is read
    ReadCommitted,
    /// Default
    #[default]
    RepeatableRead,
    /// Fully serialized
    Serializable,
}

/// Who is driving the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionMode {
    /// Client connection
    #[default]
    Local,
    /// Applier or replayer
    HighPriority,
    /// Executing a total-order action
    TotalOrder,
}

/// Kill request recorded on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KillState {
    /// Not killed
    #[default]
    NotKilled,
    /// Abort the running statement
    Query,
    /// Close the connection
    Connection,
}

/// Identifier of the network channel attached to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// The shadowable attribute group
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionAttrs {
    /// Option bits
    pub option_bits: OptionBits,
    /// Server status
    pub server_status: ServerStatus,
    /// Attached network channel
    pub channel: Option<ChannelId>,
    /// Isolation level
    pub isolation: IsolationLevel,
    /// Current database
    pub db: Option<String>,
    /// Fixed statement time, if any
    pub user_time: Option<DateTime<Utc>>,
    /// Rows affected by the current statement
    pub row_count: u64,
    /// Kill requests are refused
    pub non_killable: bool,
}

/// Mutable session state
#[derive(Debug, Default)]
pub struct SessionState {
    /// Shadowable attributes
    pub attrs: SessionAttrs,
    /// Replication transaction, if one is open
    pub transaction: Option<Transaction>,
    /// Diagnostics area
    pub diagnostics: Diagnostics,
    /// Who drives the session
    pub mode: SessionMode,
    /// Pending kill request
    pub killed: KillState,
    /// Server id propagated from the event being applied
    pub origin_server_id: u32,
    /// Statement start time propagated from the event being applied
    pub start_time: Option<DateTime<Utc>>,
    /// Format description cached by the apply loop
    pub apply_format: Option<FormatDescription>,
    /// An error was tolerated while applying
    pub has_ignored_error: bool,
    /// Executing a client command right now
    pub in_command: bool,
    /// Metadata locks
    pub mdl: MdlContext,
    /// What the session is doing, for process lists
    pub proc_info: &'static str,
    /// GTID set by the last non-empty GTID event
    pub gtid_next: Option<([u8; 16], u64)>,
    rollback_complete: bool,
    owner: Option<ThreadId>,
}

impl SessionState {
    /// Replication transaction or `InvalidState`
    pub fn transaction(&self) -> replicore_core::Result<&Transaction> {
        self.transaction
            .as_ref()
            .ok_or_else(|| replicore_core::ReplicationError::InvalidState("no transaction".into()))
    }

    /// Mutable replication transaction or `InvalidState`
    pub fn transaction_mut(&mut self) -> replicore_core::Result<&mut Transaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| replicore_core::ReplicationError::InvalidState("no transaction".into()))
    }
}

/// A session
#[derive(Debug)]
pub struct Session {
    id: u64,
    state: Mutex<SessionState>,
    rollback_done: Condvar,
}

impl Session {
    /// New local session
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                proc_info: "idle",
                ..SessionState::default()
            }),
            rollback_done: Condvar::new(),
        }
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lock the session state
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Make the calling thread the owner of the session
    pub fn store_globals(&self) {
        self.state.lock().owner = Some(thread::current().id());
    }

    /// Give up ownership
    pub fn restore_globals(&self) {
        self.state.lock().owner = None;
    }

    /// Thread that currently owns the session
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Request a kill; refused for non-killable sessions
    pub fn kill(&self, kind: KillState) -> bool {
        let mut state = self.state.lock();
        if state.attrs.non_killable {
            debug!(target: "replicore::session", session = self.id, "kill refused, session is non-killable");
            return false;
        }
        state.killed = kind;
        true
    }

    /// Clear a pending kill request
    pub fn reset_kill(&self) {
        self.state.lock().killed = KillState::NotKilled;
    }

    /// Arm the rollback-complete signal before queueing a rollback
    pub fn reset_rollback_complete(&self) {
        self.state.lock().rollback_complete = false;
    }

    /// Signal that a background rollback of this session finished
    pub fn sync_rollback_complete(&self) {
        let mut state = self.state.lock();
        state.rollback_complete = true;
        drop(state);
        self.rollback_done.notify_all();
    }

    /// Wait for [`Session::sync_rollback_complete`]
    ///
    /// Returns false on timeout.
    pub fn wait_rollback_complete(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !state.rollback_complete {
            if self.rollback_done.wait_until(&mut state, deadline).timed_out() {
                return state.rollback_complete;
            }
        }
        true
    }

    /// Replication transaction state, if any
    pub fn transaction_state(&self) -> Option<crate::TransactionState> {
        self.state.lock().transaction.as_ref().map(|t| t.state())
    }
}
