//! Applying replicated write-sets

use crate::common::{inserts, row, server, single};
use replicore::{
    start_appliers, ApplierService, EventWriter, FormatDescription, Gtid, HighPriorityService,
    LoopbackProvider, Provider, ReplicationConfig, ReplicationError, Seqno, ServerId,
    TransactionId, TransactionState, Value, WsHandle, WsMeta,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn meta(seqno: i64, trx: u64) -> (WsHandle, WsMeta) {
    let id = TransactionId::new(trx);
    (
        WsHandle::new(id, 0),
        WsMeta::new(Gtid::new(ServerId::new(), Seqno::new(seqno)), ServerId::new(), id, single()),
    )
}

#[test]
fn test_single_write_set_commits_without_fragment() {
    let server = server(ReplicationConfig::default());
    let mut applier = ApplierService::new(Arc::clone(&server), server.acquire_session());
    let (handle, meta) = meta(1, 1);

    applier.store_globals();
    applier.start_transaction(handle, &meta).unwrap();
    applier.apply_write_set(&meta, &inserts(&[(1, "a")])).unwrap();
    assert!(applier
        .session()
        .lock()
        .transaction()
        .unwrap()
        .fragments()
        .is_empty());
    applier.commit(handle, &meta).unwrap();
    assert_eq!(
        applier.session().transaction_state(),
        Some(TransactionState::Committed)
    );
    applier.after_apply();
    applier.reset_globals();

    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "a")]);
    assert!(server
        .streaming_log()
        .fragments(meta.server_id, meta.transaction_id)
        .unwrap()
        .is_empty());
    assert_eq!(server.commit_order().position(), Seqno::new(1));
    assert_eq!(server.checkpoint().seqno, Seqno::new(1));
    server.release_high_priority_service(applier);
}

#[test]
fn test_unparsable_event_stops_the_write_set() {
    let server = server(ReplicationConfig::default());
    let mut applier = ApplierService::new(Arc::clone(&server), server.acquire_session());
    let (handle, meta) = meta(1, 1);

    let head = inserts(&[(1, "a")]);
    let mut tail_writer = EventWriter::new(7);
    tail_writer.write_rows("t", vec![row(2, "b")]);
    let tail = tail_writer.finish();
    let mut corrupt = tail.clone();
    corrupt[4] = 0xEE;

    let mut buf = head;
    buf.extend_from_slice(&corrupt);
    buf.extend_from_slice(&tail);

    applier.store_globals();
    applier.start_transaction(handle, &meta).unwrap();
    let err = applier.apply_write_set(&meta, &buf).unwrap_err();
    assert!(matches!(err, ReplicationError::MalformedEvent { .. }));
    assert!(!applier.apply_error().is_empty());

    // the event behind the bad one was never executed
    let storage = applier
        .session()
        .lock()
        .transaction()
        .unwrap()
        .storage_trx()
        .unwrap();
    assert!(server.engine().get(Some(storage), "t", &Value::Int(1)).unwrap().is_some());
    assert!(server.engine().get(Some(storage), "t", &Value::Int(2)).unwrap().is_none());

    applier.rollback(handle, &meta).unwrap();
    applier.after_apply();
    applier.reset_globals();
    assert!(server.engine().scan("t").unwrap().is_empty());
    assert_eq!(server.commit_order().position(), Seqno::new(1));
    server.release_high_priority_service(applier);
}

#[test]
fn test_failed_write_set_is_dumped_and_skipped() {
    let dumps = TempDir::new().unwrap();
    let config = ReplicationConfig {
        dump_dir: Some(dumps.path().to_path_buf()),
        ..ReplicationConfig::default()
    };
    let server = server(config);
    let provider = Arc::new(LoopbackProvider::new());
    let appliers = start_appliers(&server, provider.clone(), 1).unwrap();

    let mut writer = EventWriter::new(7);
    writer.format_description(FormatDescription::v4());
    writer.write_rows("missing", vec![row(1, "a")]);
    provider.deliver(ServerId::new(), TransactionId::new(1), single(), writer.finish());
    provider.deliver(ServerId::new(), TransactionId::new(2), single(), inserts(&[(2, "b")]));
    assert!(provider.wait_idle(Duration::from_secs(5)));
    provider.close();
    appliers.join().unwrap();

    assert_eq!(server.engine().scan("t").unwrap(), vec![row(2, "b")]);
    assert_eq!(server.commit_order().position(), Seqno::new(2));
    assert_eq!(provider.stats().failed, 1);

    let dumped: Vec<String> = std::fs::read_dir(dumps.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(dumped.len(), 1);
    assert!(dumped[0].starts_with("GRA_") && dumped[0].ends_with("_1.log"));
}

#[test]
fn test_idempotent_apply_tolerates_duplicates() {
    let dumps = TempDir::new().unwrap();
    let config = ReplicationConfig {
        idempotent_apply: true,
        dump_dir: Some(dumps.path().to_path_buf()),
        ..ReplicationConfig::default()
    };
    let server = server(config);
    let provider = Arc::new(LoopbackProvider::new());
    let appliers = start_appliers(&server, provider.clone(), 1).unwrap();

    provider.deliver(ServerId::new(), TransactionId::new(1), single(), inserts(&[(1, "a")]));
    provider.deliver(ServerId::new(), TransactionId::new(2), single(), inserts(&[(1, "again")]));
    assert!(provider.wait_idle(Duration::from_secs(5)));
    provider.close();
    appliers.join().unwrap();

    assert_eq!(provider.stats().failed, 0);
    assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "again")]);
    // tolerated errors are still dumped for inspection
    assert_eq!(std::fs::read_dir(dumps.path()).unwrap().count(), 1);
}
