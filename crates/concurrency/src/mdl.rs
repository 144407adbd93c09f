//! Per-session metadata lock bookkeeping
//!
//! Tracks which table metadata locks a session holds and for how long they
//! live. Locks are released in groups by duration.

use smallvec::SmallVec;

/// How long a metadata lock lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MdlDuration {
    /// Until the end of the statement
    Statement,
    /// Until commit or rollback
    Transaction,
    /// Until released explicitly (table locks)
    Explicit,
}

/// A held metadata lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdlTicket {
    /// Locked object
    pub object: String,
    /// Lifetime
    pub duration: MdlDuration,
}

/// Metadata locks held by one session
#[derive(Debug, Clone, Default)]
pub struct MdlContext {
    tickets: SmallVec<[MdlTicket; 4]>,
}

impl MdlContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a lock on `object`; a lock already held with the same duration is kept once
    pub fn acquire(&mut self, object: &str, duration: MdlDuration) {
        if self.holds(object, duration) {
            return;
        }
        self.tickets.push(MdlTicket {
            object: object.to_string(),
            duration,
        });
    }

    /// True if `object` is locked with `duration`
    pub fn holds(&self, object: &str, duration: MdlDuration) -> bool {
        self.tickets
            .iter()
            .any(|t| t.object == object && t.duration == duration)
    }

    fn release(&mut self, duration: MdlDuration) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|t| t.duration != duration);
        before - self.tickets.len()
    }

    /// Release statement locks
    pub fn release_statement_locks(&mut self) -> usize {
        self.release(MdlDuration::Statement)
    }

    /// Release statement and transaction locks
    pub fn release_transactional_locks(&mut self) -> usize {
        self.release(MdlDuration::Statement) + self.release(MdlDuration::Transaction)
    }

    /// Release explicit locks
    pub fn release_explicit_locks(&mut self) -> usize {
        self.release(MdlDuration::Explicit)
    }

    /// True if any explicit lock is held
    pub fn has_explicit_locks(&self) -> bool {
        self.tickets
            .iter()
            .any(|t| t.duration == MdlDuration::Explicit)
    }

    /// Number of held locks
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// True if nothing is held
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
