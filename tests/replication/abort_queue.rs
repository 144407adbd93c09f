//! Abort queues and the background rollback handshake

use crate::common::{row, server, wait_until};
use replicore::{
    AbortCoordinator, AbortRequest, ClientSession, LoopbackProvider, ReplicationConfig,
    ReplicationError, Session, SessionQueue, TransactionState,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_duplicate_push_is_rejected() {
    let queue = SessionQueue::new();
    let session = Arc::new(Session::new(9));

    queue.push(Arc::clone(&session)).unwrap();
    let err = queue.push(Arc::clone(&session)).unwrap_err();
    assert!(matches!(err, ReplicationError::DuplicateAbortRequest(9)));
    assert_eq!(queue.len(), 1);
    assert!(queue.contains(9));

    // once popped the session may be queued again
    assert_eq!(queue.pop().map(|s| s.id()), Some(9));
    assert!(!queue.contains(9));
    queue.push(session).unwrap();
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_close_drains_then_stops_consumer() {
    let queue = Arc::new(SessionQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(session) = queue.pop() {
                seen.push(session.id());
            }
            seen
        })
    };

    for id in 1..=3 {
        queue.push(Arc::new(Session::new(id))).unwrap();
    }
    queue.close();
    assert!(queue.push(Arc::new(Session::new(4))).is_err());
    assert_eq!(consumer.join().unwrap(), vec![1, 2, 3]);
    assert!(queue.is_empty() && queue.is_closed());
}

#[test]
fn test_fire_rollbacker_requires_running_worker() {
    let server = server(ReplicationConfig::default());
    let victim = server.acquire_session();
    let err = server.fire_rollbacker(&victim).unwrap_err();
    assert!(matches!(err, ReplicationError::InvalidState(_)));

    let coordinator = AbortCoordinator::start(&server).unwrap();
    coordinator.shutdown();
    assert!(server.fire_rollbacker(&victim).is_err());
}

#[test]
fn test_idle_victim_signals_rollback_complete() {
    let server = server(ReplicationConfig::default());
    let provider = Arc::new(LoopbackProvider::new());
    let coordinator = AbortCoordinator::start(&server).unwrap();
    let initiator = server.acquire_session();

    let mut victim = ClientSession::connect(&server, provider.clone());
    victim.begin().unwrap();
    victim.insert("t", row(1, "victim")).unwrap();
    let session = Arc::clone(victim.session());

    assert_eq!(server.request_abort(&initiator, &session), AbortRequest::Accepted);
    assert!(session.wait_rollback_complete(Duration::from_secs(5)));
    assert!(wait_until(|| session.transaction_state() == Some(TransactionState::Aborted)));
    assert_eq!(server.bf_aborts(), 1);

    // the victim's row lock is gone
    let mut other = ClientSession::connect(&server, provider.clone());
    other.begin().unwrap();
    other.insert("t", row(1, "other")).unwrap();
    other.commit().unwrap();
    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "other")]);

    // a second abort of the same victim finds nothing to do
    assert_eq!(server.request_abort(&initiator, &session), AbortRequest::Rejected);
    assert_eq!(victim.insert("t", row(2, "x")).unwrap_err().code(), Some(1213));

    coordinator.shutdown();
}
