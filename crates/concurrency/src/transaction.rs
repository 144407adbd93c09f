//! Replication transaction state machine
//!
//! ## State Machine
//!
//! ```text
//! Executing ─► Preparing ─► Certifying ─► Committing ─► OrderedCommit ─► Committed
//!     │            │            │  │          │
//!     │            │            │  └► CertFailed ─► Aborting ─► Aborted
//!     └────────────┴────────────┴─► MustAbort ─┘        ▲
//!                                       │               │
//!                  Committing ─► MustReplay ─► Replaying┘ (─► Committing)
//! ```
//!
//! High-priority appliers go straight from `Executing` to `Committing`.
//! Every transition is checked against [`TransactionState::can_transition_to`].

use replicore_core::{ReplicationError, Result, Seqno, ServerId, TransactionId, WsHandle, WsMeta};
use replicore_storage::StorageTrx;
use smallvec::SmallVec;
use std::fmt;

/// State of a replication transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Statements are running
    Executing,
    /// Preparing for commit
    Preparing,
    /// Waiting for the certification result
    Certifying,
    /// Certified or ordered, committing
    Committing,
    /// Inside the commit order critical section
    OrderedCommit,
    /// Done, changes visible
    Committed,
    /// Certification failed
    CertFailed,
    /// A high-priority action asked this transaction to abort
    MustAbort,
    /// Rollback in progress
    Aborting,
    /// Rolled back
    Aborted,
    /// Aborted after certification, must be replayed
    MustReplay,
    /// Replay in progress
    Replaying,
}

impl TransactionState {
    /// True if `self → next` is allowed
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Executing, Preparing | Certifying | Committing | MustAbort | Aborting)
                | (Preparing, Certifying | Committing | MustAbort | Aborting)
                | (Certifying, Committing | CertFailed | MustAbort | MustReplay | Aborting)
                | (Committing, OrderedCommit | Committed | MustReplay | Aborting)
                | (OrderedCommit, Committed)
                | (CertFailed, Aborting)
                | (MustAbort, Aborting | MustReplay)
                | (Aborting, Aborted)
                | (MustReplay, Replaying | Aborting)
                | (Replaying, Committing | Committed | Aborting)
        )
    }

    /// True once the transaction can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Executing => "executing",
            TransactionState::Preparing => "preparing",
            TransactionState::Certifying => "certifying",
            TransactionState::Committing => "committing",
            TransactionState::OrderedCommit => "ordered_commit",
            TransactionState::Committed => "committed",
            TransactionState::CertFailed => "cert_failed",
            TransactionState::MustAbort => "must_abort",
            TransactionState::Aborting => "aborting",
            TransactionState::Aborted => "aborted",
            TransactionState::MustReplay => "must_replay",
            TransactionState::Replaying => "replaying",
        };
        f.write_str(s)
    }
}

/// A replication transaction bound to one session
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    server_id: ServerId,
    state: TransactionState,
    history: SmallVec<[TransactionState; 8]>,
    handle: WsHandle,
    meta: WsMeta,
    fragments: Vec<Seqno>,
    streaming: bool,
    bf_aborted_in_total_order: bool,
    storage_trx: Option<StorageTrx>,
}

impl Transaction {
    /// Transaction in `Executing`
    pub fn new(id: TransactionId, server_id: ServerId) -> Self {
        Self {
            id,
            server_id,
            state: TransactionState::Executing,
            history: SmallVec::new(),
            handle: WsHandle::new(id, 0),
            meta: WsMeta::default(),
            fragments: Vec::new(),
            streaming: false,
            bf_aborted_in_total_order: false,
            storage_trx: None,
        }
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Originating node
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// States left so far, oldest first
    pub fn history(&self) -> &[TransactionState] {
        &self.history
    }

    /// Move to `next`
    ///
    /// # Errors
    /// `InvalidState` if the matrix does not allow the transition.
    pub fn transition(&mut self, next: TransactionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ReplicationError::InvalidState(format!(
                "transaction {}: {} -> {} not allowed",
                self.id, self.state, next
            )));
        }
        self.history.push(self.state);
        self.state = next;
        Ok(())
    }

    /// Provider handle
    pub fn handle(&self) -> WsHandle {
        self.handle
    }

    /// Metadata of the write-set being applied or committed
    pub fn meta(&self) -> &WsMeta {
        &self.meta
    }

    /// Record handle and metadata
    pub fn set_ws(&mut self, handle: WsHandle, meta: WsMeta) {
        self.handle = handle;
        self.meta = meta;
    }

    /// Seqno of the current write-set
    pub fn seqno(&self) -> Seqno {
        self.meta.gtid.seqno
    }

    /// True if the provider ordered the current write-set
    pub fn is_ordered(&self) -> bool {
        self.meta.is_ordered()
    }

    /// Record that a fragment was applied at `seqno`
    pub fn fragment_applied(&mut self, seqno: Seqno) {
        self.streaming = true;
        self.fragments.push(seqno);
    }

    /// Seqnos of applied fragments
    pub fn fragments(&self) -> &[Seqno] {
        &self.fragments
    }

    /// Forget applied fragments
    pub fn clear_fragments(&mut self) {
        self.fragments.clear();
    }

    /// True for streaming transactions
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Mark as streaming without a recorded fragment
    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    /// Aborted by a total-order action
    pub fn bf_aborted_in_total_order(&self) -> bool {
        self.bf_aborted_in_total_order
    }

    /// Record whether the aborter ran in total order
    pub fn set_bf_aborted_in_total_order(&mut self, value: bool) {
        self.bf_aborted_in_total_order = value;
    }

    /// Storage transaction carrying the changes
    pub fn storage_trx(&self) -> Option<StorageTrx> {
        self.storage_trx
    }

    /// Attach a storage transaction
    pub fn set_storage_trx(&mut self, trx: Option<StorageTrx>) {
        self.storage_trx = trx;
    }

    /// Detach and return the storage transaction
    pub fn take_storage_trx(&mut self) -> Option<StorageTrx> {
        self.storage_trx.take()
    }
}
