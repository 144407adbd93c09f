//! Commit order monitor
//!
//! Ordered actions commit in seqno order. `enter(seqno)` blocks until every
//! seqno before it has left; `leave(seqno)` (or `skip` for actions that
//! never entered) releases the slot. Seqnos may leave out of order, the
//! committed position only advances over contiguous released seqnos.
//!
//! A waiter can be interrupted: `interrupt()` wakes every waiter so it can
//! re-evaluate its abort predicate.

use parking_lot::{Condvar, Mutex};
use replicore_core::Seqno;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::trace;

/// Result of [`CommitOrder::enter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEntry {
    /// All predecessors have left; the caller owns the slot
    Entered,
    /// The abort predicate fired while waiting
    Interrupted,
}

#[derive(Debug)]
struct OrderState {
    last_left: i64,
    released: BTreeSet<i64>,
}

/// Commit order monitor
#[derive(Debug)]
pub struct CommitOrder {
    state: Mutex<OrderState>,
    advanced: Condvar,
}

const RECHECK: Duration = Duration::from_millis(50);

impl CommitOrder {
    /// Monitor whose committed position is `position`
    pub fn new(position: Seqno) -> Self {
        Self {
            state: Mutex::new(OrderState {
                last_left: position.get().max(0),
                released: BTreeSet::new(),
            }),
            advanced: Condvar::new(),
        }
    }

    /// Last seqno such that it and all before it have left
    pub fn position(&self) -> Seqno {
        Seqno::new(self.state.lock().last_left)
    }

    /// Wait until `seqno` may commit
    ///
    /// `should_abort` is checked before every wait and after every wakeup.
    pub fn enter(&self, seqno: Seqno, should_abort: impl Fn() -> bool) -> OrderEntry {
        let mut state = self.state.lock();
        loop {
            if state.last_left + 1 >= seqno.get() {
                trace!(target: "replicore::order", seqno = seqno.get(), "entered commit order");
                return OrderEntry::Entered;
            }
            if should_abort() {
                return OrderEntry::Interrupted;
            }
            self.advanced.wait_for(&mut state, RECHECK);
        }
    }

    /// Release `seqno` after commit
    pub fn leave(&self, seqno: Seqno) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let s = seqno.get();
        if s > state.last_left {
            state.released.insert(s);
            while state.released.remove(&(state.last_left + 1)) {
                state.last_left += 1;
            }
        }
        drop(guard);
        trace!(target: "replicore::order", seqno = seqno.get(), "left commit order");
        self.advanced.notify_all();
    }

    /// Release `seqno` for an action that rolled back instead of committing
    pub fn skip(&self, seqno: Seqno) {
        self.leave(seqno);
    }

    /// Wake every waiter so it re-checks its abort predicate
    pub fn interrupt(&self) {
        let _state = self.state.lock();
        self.advanced.notify_all();
    }
}

impl Default for CommitOrder {
    fn default() -> Self {
        Self::new(Seqno::new(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_seqno_enters_immediately() {
        let order = CommitOrder::default();
        assert_eq!(order.enter(Seqno::new(1), || false), OrderEntry::Entered);
        order.leave(Seqno::new(1));
        assert_eq!(order.position(), Seqno::new(1));
    }

    #[test]
    fn test_out_of_order_leave_advances_contiguously() {
        let order = CommitOrder::default();
        order.leave(Seqno::new(3));
        order.leave(Seqno::new(2));
        assert_eq!(order.position(), Seqno::new(0));
        order.leave(Seqno::new(1));
        assert_eq!(order.position(), Seqno::new(3));
        // stale leave is ignored
        order.leave(Seqno::new(2));
        assert_eq!(order.position(), Seqno::new(3));
    }

    #[test]
    fn test_waiter_enters_after_predecessor_leaves() {
        let order = Arc::new(CommitOrder::default());
        let waiter = {
            let order = Arc::clone(&order);
            thread::spawn(move || order.enter(Seqno::new(2), || false))
        };
        thread::sleep(Duration::from_millis(20));
        order.skip(Seqno::new(1));
        assert_eq!(waiter.join().unwrap(), OrderEntry::Entered);
    }

    #[test]
    fn test_interrupt() {
        let order = Arc::new(CommitOrder::default());
        let abort = Arc::new(AtomicBool::new(false));
        let waiter = {
            let order = Arc::clone(&order);
            let abort = Arc::clone(&abort);
            thread::spawn(move || order.enter(Seqno::new(5), || abort.load(Ordering::SeqCst)))
        };
        thread::sleep(Duration::from_millis(20));
        abort.store(true, Ordering::SeqCst);
        order.interrupt();
        assert_eq!(waiter.join().unwrap(), OrderEntry::Interrupted);
        assert_eq!(order.position(), Seqno::new(0));
    }
}
