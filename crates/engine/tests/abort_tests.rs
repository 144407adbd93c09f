//! Forced abort tests for replicore-engine
//!
//! 1. **Idle victim** - a local transaction idle between statements is
//!    rolled back by the rollbacker and finished by the post-rollbacker;
//!    without a rollbacker it rolls itself back at the next statement
//! 2. **Victim inside a statement** - only its lock wait is broken; it rolls
//!    itself back when the statement returns
//! 3. **Committing victim** - a certified local transaction ordered after
//!    the applier is replayed and still commits
//! 4. **Local streaming victim** - its fragments are removed, its row locks
//!    released and it ends `Aborted`, even when the fragment delete fails
//! 5. **Streaming applier victim** - fragments are removed before the
//!    applier is rolled back and its session is pooled afterwards

use replicore_concurrency::{Session, Transaction, TransactionState};
use replicore_core::{EventWriter, FormatDescription, Row, Seqno, ServerId, TransactionId, Value, WsFlags};
use replicore_engine::{
    start_appliers, AbortCoordinator, AbortRequest, ClientSession, LoopbackProvider, Provider,
    ReplicationConfig, ServerContext,
};
use replicore_storage::{Fragment, TrxOptions};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

fn server() -> Arc<ServerContext> {
    let config = ReplicationConfig {
        lock_wait_timeout_ms: 2000,
        ..ReplicationConfig::default()
    };
    let server = ServerContext::in_memory(config).unwrap();
    server.engine().create_table("t", false).unwrap();
    server
}

fn row(id: i64, v: &str) -> Row {
    vec![Value::Int(id), Value::Text(v.to_string())]
}

fn inserts(rows: &[(i64, &str)]) -> Vec<u8> {
    let mut writer = EventWriter::new(7);
    writer.format_description(FormatDescription::v4());
    writer.write_rows("t", rows.iter().map(|(id, v)| row(*id, v)).collect());
    writer.finish()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn single() -> WsFlags {
    WsFlags::START_TRANSACTION | WsFlags::COMMIT
}

/// Local streaming transaction with fragments 1 and 2 in the log and an
/// uncommitted insert of row 1
fn streaming_victim(server: &Arc<ServerContext>, id: TransactionId) -> Arc<Session> {
    let node = server.node_id();
    let log_trx = server.engine().begin(TrxOptions::default());
    for seqno in 1..=2 {
        server
            .streaming_log()
            .append(
                log_trx,
                &Fragment {
                    server_id: node,
                    transaction_id: id,
                    seqno: Seqno::new(seqno),
                    flags: if seqno == 1 { WsFlags::START_TRANSACTION } else { WsFlags::empty() },
                    payload: inserts(&[(10 + seqno, "fragment")]),
                },
            )
            .unwrap();
    }
    server.engine().commit(log_trx, false).unwrap();

    let storage = server.engine().begin(TrxOptions::default());
    server.engine().insert(storage, "t", row(1, "victim")).unwrap();
    let mut trx = Transaction::new(id, node);
    trx.set_streaming(true);
    trx.fragment_applied(Seqno::new(1));
    trx.fragment_applied(Seqno::new(2));
    trx.set_storage_trx(Some(storage));

    let session = server.acquire_session();
    session.lock().transaction = Some(trx);
    session
}

/// Row 1 can be written and committed by someone else
fn row_one_is_free(server: &ServerContext) {
    let trx = server.engine().begin(TrxOptions::default());
    server.engine().insert(trx, "t", row(1, "after")).unwrap();
    server.engine().commit(trx, false).unwrap();
}

// ============================================================================
// Local victims
// ============================================================================

#[test]
fn test_idle_victim_rolled_back_in_background() {
    let server = server();
    let provider = Arc::new(LoopbackProvider::new());
    let coordinator = AbortCoordinator::start(&server).unwrap();
    let appliers = start_appliers(&server, provider.clone(), 1).unwrap();

    let mut client = ClientSession::connect(&server, provider.clone());
    client.begin().unwrap();
    client.insert("t", row(1, "local")).unwrap();

    provider.deliver(ServerId::new(), TransactionId::new(1), single(), inserts(&[(1, "remote")]));
    assert!(provider.wait_idle(Duration::from_secs(5)));
    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "remote")]);
    assert_eq!(server.bf_aborts(), 1);

    let session = Arc::clone(client.session());
    assert!(wait_until(|| session.transaction_state() == Some(TransactionState::Aborted)));

    // the next statement reports the abort
    let err = client.insert("t", row(2, "x")).unwrap_err();
    assert_eq!(err.code(), Some(1213));

    // and the connection stays usable
    client.begin().unwrap();
    client.insert("t", row(2, "again")).unwrap();
    client.commit().unwrap();
    assert_eq!(server.commit_order().position(), Seqno::new(2));

    provider.close();
    appliers.join().unwrap();
    coordinator.shutdown();
}

#[test]
fn test_victim_inside_statement_gets_lock_break_only() {
    let server = server();
    let provider = Arc::new(LoopbackProvider::new());
    let coordinator = AbortCoordinator::start(&server).unwrap();
    let appliers = start_appliers(&server, provider.clone(), 1).unwrap();

    let mut holder = ClientSession::connect(&server, provider.clone());
    holder.begin().unwrap();
    holder.insert("t", row(1, "holder")).unwrap();

    let mut victim = ClientSession::connect(&server, provider.clone());
    victim.begin().unwrap();
    victim.insert("t", row(2, "victim")).unwrap();
    let victim_session = Arc::clone(victim.session());
    let victim_trx = victim_session
        .lock()
        .transaction
        .as_ref()
        .and_then(|t| t.storage_trx())
        .unwrap();

    let blocked = thread::spawn(move || {
        let result = victim.insert("t", row(1, "victim"));
        (victim, result)
    });
    assert!(wait_until(|| server.engine().is_waiting(victim_trx)));

    provider.deliver(ServerId::new(), TransactionId::new(1), single(), inserts(&[(2, "remote")]));
    let (victim, result) = blocked.join().unwrap();
    assert_eq!(result.unwrap_err().code(), Some(1213));
    assert!(victim.session().lock().transaction.is_none());

    assert!(provider.wait_idle(Duration::from_secs(5)));
    assert_eq!(server.engine().scan("t").unwrap(), vec![row(2, "remote")]);

    holder.commit().unwrap();
    assert_eq!(
        server.engine().scan("t").unwrap(),
        vec![row(1, "holder"), row(2, "remote")]
    );

    provider.close();
    appliers.join().unwrap();
    coordinator.shutdown();
}

#[test]
fn test_committing_victim_is_replayed() {
    let server = server();
    let seed = server.engine().begin(TrxOptions::default());
    server.engine().insert(seed, "t", row(1, "orig")).unwrap();
    server.engine().commit(seed, false).unwrap();

    let provider = Arc::new(LoopbackProvider::new());
    let coordinator = AbortCoordinator::start(&server).unwrap();

    // remote update ordered first
    let mut writer = EventWriter::new(7);
    writer.format_description(FormatDescription::v4());
    writer.update_rows("t", vec![(row(1, "orig"), row(1, "remote"))]);
    provider.deliver(ServerId::new(), TransactionId::new(1), single(), writer.finish());

    let mut client = ClientSession::connect(&server, provider.clone());
    client.begin().unwrap();
    client.update("t", row(1, "orig"), row(1, "local")).unwrap();
    let session = Arc::clone(client.session());
    let committer = thread::spawn(move || {
        let result = client.commit();
        (client, result)
    });
    assert!(wait_until(|| session.transaction_state() == Some(TransactionState::Committing)));

    let appliers = start_appliers(&server, provider.clone(), 1).unwrap();
    let (client, result) = committer.join().unwrap();
    result.unwrap();
    assert!(provider.wait_idle(Duration::from_secs(5)));

    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "local")]);
    assert_eq!(server.commit_order().position(), Seqno::new(2));
    assert!(server.bf_aborts() >= 1);
    assert!(client.session().lock().transaction.is_none());

    provider.close();
    appliers.join().unwrap();
    coordinator.shutdown();
}

#[test]
fn test_victim_without_rollbacker_rolls_itself_back() {
    let server = server();
    let provider = Arc::new(LoopbackProvider::new());
    let initiator = server.acquire_session();

    let mut client = ClientSession::connect(&server, provider.clone());
    client.begin().unwrap();
    client.insert("t", row(1, "local")).unwrap();
    let session = Arc::clone(client.session());

    assert_eq!(server.request_abort(&initiator, &session), AbortRequest::Accepted);
    assert_eq!(session.transaction_state(), Some(TransactionState::MustAbort));

    assert_eq!(client.insert("t", row(2, "x")).unwrap_err().code(), Some(1213));
    row_one_is_free(&server);

    client.begin().unwrap();
    client.insert("t", row(2, "again")).unwrap();
    client.commit().unwrap();
    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "after"), row(2, "again")]);
}

#[test]
fn test_request_abort_rejects_finished_victim() {
    let server = server();
    let provider = Arc::new(LoopbackProvider::new());
    let initiator = server.acquire_session();

    let mut client = ClientSession::connect(&server, provider.clone());
    client.begin().unwrap();
    client.insert("t", row(1, "a")).unwrap();
    client.commit().unwrap();
    assert_eq!(
        server.request_abort(&initiator, client.session()),
        AbortRequest::Rejected
    );
    assert_eq!(server.bf_aborts(), 0);
}

#[test]
fn test_local_streaming_victim_loses_fragments() {
    let server = server();
    let coordinator = AbortCoordinator::start(&server).unwrap();
    let initiator = server.acquire_session();
    let id = TransactionId::new(30);
    let victim = streaming_victim(&server, id);

    assert_eq!(server.request_abort(&initiator, &victim), AbortRequest::Accepted);
    assert!(victim.wait_rollback_complete(Duration::from_secs(5)));
    assert!(wait_until(|| victim.transaction_state() == Some(TransactionState::Aborted)));

    assert!(server.streaming_log().fragments(server.node_id(), id).unwrap().is_empty());
    assert!(victim.lock().transaction.as_ref().unwrap().storage_trx().is_none());
    row_one_is_free(&server);
    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "after")]);

    coordinator.shutdown();
}

#[test]
fn test_local_victim_rolled_back_when_fragment_delete_fails() {
    let config = ReplicationConfig {
        lock_wait_timeout_ms: 200,
        ..ReplicationConfig::default()
    };
    let server = ServerContext::in_memory(config).unwrap();
    server.engine().create_table("t", false).unwrap();
    let coordinator = AbortCoordinator::start(&server).unwrap();
    let initiator = server.acquire_session();
    let id = TransactionId::new(31);
    let victim = streaming_victim(&server, id);

    // another transaction holds the lock on fragment 1, so the delete times out
    let holder = server.engine().begin(TrxOptions::default());
    server
        .streaming_log()
        .remove(holder, server.node_id(), id, &[Seqno::new(1)])
        .unwrap();

    assert_eq!(server.request_abort(&initiator, &victim), AbortRequest::Accepted);
    assert!(victim.wait_rollback_complete(Duration::from_secs(5)));
    assert!(wait_until(|| victim.transaction_state() == Some(TransactionState::Aborted)));
    row_one_is_free(&server);

    server.engine().rollback(holder);
    assert_eq!(server.streaming_log().fragments(server.node_id(), id).unwrap().len(), 2);

    coordinator.shutdown();
}

// ============================================================================
// High-priority victims
// ============================================================================

#[test]
fn test_streaming_applier_victim_loses_fragments_first() {
    let server = server();
    let provider = Arc::new(LoopbackProvider::new());
    let coordinator = AbortCoordinator::start(&server).unwrap();
    let appliers = start_appliers(&server, provider.clone(), 1).unwrap();

    let origin = ServerId::new();
    let streaming = TransactionId::new(10);
    provider.deliver(origin, streaming, WsFlags::START_TRANSACTION, inserts(&[(1, "stream")]));
    assert!(provider.wait_idle(Duration::from_secs(5)));
    assert_eq!(server.streaming_applier_count(), 1);
    assert_eq!(server.streaming_log().fragments(origin, streaming).unwrap().len(), 1);
    let pooled_before = server.pooled_sessions();

    provider.deliver(ServerId::new(), TransactionId::new(20), single(), inserts(&[(1, "winner")]));
    assert!(provider.wait_idle(Duration::from_secs(5)));

    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "winner")]);
    assert_eq!(server.bf_aborts(), 1);
    assert!(wait_until(|| server.aborted_applier_count() == 0));
    assert_eq!(server.streaming_applier_count(), 0);
    assert!(server.streaming_log().fragments(origin, streaming).unwrap().is_empty());
    assert!(wait_until(|| server.pooled_sessions() > pooled_before));

    // later fragments of the aborted transaction are discarded
    provider.deliver(origin, streaming, WsFlags::COMMIT, inserts(&[(2, "late")]));
    assert!(provider.wait_idle(Duration::from_secs(5)));
    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "winner")]);
    assert_eq!(server.commit_order().position(), Seqno::new(3));

    provider.close();
    appliers.join().unwrap();
    coordinator.shutdown();
}
