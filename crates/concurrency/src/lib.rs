//! Concurrency layer for replicore
//!
//! This crate implements the per-session execution state of the applier:
//! - Transaction: replication transaction state machine
//! - Session: shadowable attributes, diagnostics, kill state, ownership
//! - MdlContext: metadata lock bookkeeping per session
//! - CommitOrder: seqno-ordered commit monitor
//! - SessionQueue: de-duplicating FIFO used by the abort coordinator

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mdl;
pub mod order;
pub mod queue;
pub mod session;
pub mod transaction;

pub use mdl::{MdlContext, MdlDuration, MdlTicket};
pub use order::{CommitOrder, OrderEntry};
pub use queue::SessionQueue;
pub use session::{
    ChannelId, IsolationLevel, KillState, OptionBits, ServerStatus, Session, SessionAttrs,
    SessionMode, SessionState,
};
pub use transaction::{Transaction, TransactionState};

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Session: Send, Sync);
    static_assertions::assert_impl_all!(SessionQueue: Send, Sync);
    static_assertions::assert_impl_all!(CommitOrder: Send, Sync);
}
