//! De-duplicating session queue
//!
//! FIFO of sessions handed to a background worker. A session can be queued
//! at most once; a second push is reported as
//! [`ReplicationError::DuplicateAbortRequest`] and otherwise ignored.
//! Consumers block in [`SessionQueue::pop`] until an entry arrives or the
//! queue is closed and drained.

use crate::session::Session;
use parking_lot::{Condvar, Mutex};
use replicore_core::{ReplicationError, Result};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Arc<Session>>,
    queued: FxHashSet<u64>,
    closed: bool,
}

/// Lock-protected FIFO of sessions, one entry per session
#[derive(Debug, Default)]
pub struct SessionQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl SessionQueue {
    /// Empty open queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a session
    ///
    /// # Errors
    /// `DuplicateAbortRequest` if the session is already queued, `InvalidState`
    /// if the queue is closed.
    pub fn push(&self, session: Arc<Session>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ReplicationError::InvalidState("queue is closed".into()));
        }
        if !state.queued.insert(session.id()) {
            return Err(ReplicationError::DuplicateAbortRequest(session.id()));
        }
        state.entries.push_back(session);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Take the oldest session, blocking while the queue is open and empty
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<Arc<Session>> {
        let mut state = self.state.lock();
        loop {
            if let Some(session) = state.entries.pop_front() {
                state.queued.remove(&session.id());
                return Some(session);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Refuse further pushes and wake consumers
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    /// True if the session is queued
    pub fn contains(&self, session_id: u64) -> bool {
        self.state.lock().queued.contains(&session_id)
    }

    /// Entries waiting
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if nothing waits
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True after [`SessionQueue::close`]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
