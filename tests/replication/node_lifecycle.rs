//! Node start, checkpoint and restart

use crate::common::{init_tracing, inserts, row, single, wait_until};
use replicore::{
    LoopbackProvider, Node, ReplicationConfig, Seqno, ServerId, TransactionId, CONFIG_FILE_NAME,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config() -> ReplicationConfig {
    init_tracing();
    ReplicationConfig {
        applier_threads: 2,
        ..ReplicationConfig::default()
    }
}

#[test]
fn test_restart_from_checkpoint_continues_sequence() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("node.ckpt");

    let provider = Arc::new(LoopbackProvider::new());
    let node = Node::in_memory(config(), provider.clone()).unwrap();
    node.server().engine().create_table("t", false).unwrap();

    let mut client = node.client();
    client.begin().unwrap();
    client.insert("t", row(1, "local")).unwrap();
    client.commit().unwrap();
    client.close();

    provider.deliver(ServerId::new(), TransactionId::new(1), single(), inserts(&[(2, "remote")]));
    assert!(provider.wait_idle(Duration::from_secs(5)));
    assert_eq!(provider.certified().len(), 1);

    let position = node.checkpoint(&image).unwrap();
    assert_eq!(position.seqno, Seqno::new(2));
    node.shutdown().unwrap();
    drop(node);

    let provider = Arc::new(LoopbackProvider::starting_after(position.seqno));
    let node = Node::from_checkpoint(config(), &image, position, provider.clone()).unwrap();
    assert_eq!(
        node.server().engine().scan("t").unwrap(),
        vec![row(1, "local"), row(2, "remote")]
    );
    assert_eq!(node.server().commit_order().position(), Seqno::new(2));

    let mut client = node.client();
    client.begin().unwrap();
    client.insert("t", row(3, "after restart")).unwrap();
    client.commit().unwrap();
    assert_eq!(node.server().checkpoint().seqno, Seqno::new(3));
    assert_eq!(node.server().engine().scan("t").unwrap().len(), 3);
    client.close();

    node.shutdown().unwrap();
}

#[test]
fn test_shutdown_is_idempotent() {
    let provider = Arc::new(LoopbackProvider::new());
    let node = Node::in_memory(config(), provider).unwrap();
    let server = Arc::clone(node.server());
    assert!(wait_until(|| server.running_appliers() == 2));
    node.shutdown().unwrap();
    node.shutdown().unwrap();
    assert_eq!(server.running_appliers(), 0);
}

#[test]
fn test_config_written_on_first_start() {
    let dir = TempDir::new().unwrap();
    let first = ReplicationConfig::load_or_init(dir.path()).unwrap();
    assert!(dir.path().join(CONFIG_FILE_NAME).exists());

    let edited = ReplicationConfig {
        applier_threads: 3,
        ..first
    };
    edited.write_to_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
    let reloaded = ReplicationConfig::load_or_init(dir.path()).unwrap();
    assert_eq!(reloaded.applier_threads, 3);

    let node = Node::in_memory(reloaded, Arc::new(LoopbackProvider::new())).unwrap();
    assert!(wait_until(|| node.server().running_appliers() == 3));
    node.shutdown().unwrap();
}
