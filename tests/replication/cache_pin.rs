//! Pin/unpin protocol of the page cache

use replicore::{BlockNum, CacheTable, FileId, PinMode, PinOutcome, ReplicationConfig, Unlocker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const FILE: FileId = FileId(1);

#[test]
fn test_conflict_runs_locked_unlockers_once() {
    let table: CacheTable<u64> = ReplicationConfig::default().cache_table();
    let held = table.get_and_pin(FILE, BlockNum(1), 1, PinMode::WriteExpensive, || 10);

    let first = AtomicUsize::new(0);
    let second = AtomicUsize::new(0);
    let mut unlockers = vec![
        Unlocker::new(|| {
            first.fetch_add(1, Ordering::SeqCst);
        }),
        Unlocker::new(|| {
            second.fetch_add(1, Ordering::SeqCst);
        }),
    ];

    let outcome = table.get_and_pin_nonblocking(FILE, BlockNum(1), 1, PinMode::Read, || 0, &mut unlockers);
    assert!(matches!(outcome, PinOutcome::TryAgain));
    assert!(unlockers.iter().all(|u| !u.is_locked()));

    // already released locks are not released again
    let outcome = table.get_and_pin_nonblocking(FILE, BlockNum(1), 1, PinMode::Read, || 0, &mut unlockers);
    assert!(matches!(outcome, PinOutcome::TryAgain));
    drop(unlockers);
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(table.stats().try_again, 2);

    held.unpin(true);
    assert!(table.is_dirty(FILE, BlockNum(1), 1));
    table.verify().unwrap();
}

#[test]
fn test_compatible_pin_leaves_unlockers_alone() {
    let table: CacheTable<u64> = CacheTable::with_buckets(4);
    let reader = table.get_and_pin(FILE, BlockNum(7), 7, PinMode::Read, || 70);

    let ran = AtomicUsize::new(0);
    let mut unlockers = vec![Unlocker::new(|| {
        ran.fetch_add(1, Ordering::SeqCst);
    })];
    match table.get_and_pin_nonblocking(FILE, BlockNum(7), 7, PinMode::Read, || 0, &mut unlockers) {
        PinOutcome::Pinned(pair) => {
            assert_eq!(pair.with(|v| *v), 70);
            pair.unpin(false);
        }
        PinOutcome::TryAgain => panic!("shared pins do not conflict"),
    }
    assert!(unlockers[0].is_locked());
    drop(unlockers);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    reader.unpin(false);
    assert_eq!(table.stats().pinned, 0);
    assert_eq!(table.stats().fetches, 1);
}

#[test]
fn test_unlocker_may_use_the_same_bucket() {
    // one bucket: the unlocker unpins a pair that shares the busy pair's mutex
    let table: CacheTable<u64> = CacheTable::with_buckets(1);
    let busy = table.get_and_pin(FILE, BlockNum(1), 1, PinMode::WriteCheap, || 1);
    let mine = table.get_and_pin(FILE, BlockNum(2), 2, PinMode::WriteCheap, || 2);

    let mut unlockers = vec![Unlocker::new(move || mine.unpin(true))];
    let outcome = table.get_and_pin_nonblocking(FILE, BlockNum(1), 1, PinMode::WriteCheap, || 0, &mut unlockers);
    assert!(matches!(outcome, PinOutcome::TryAgain));
    assert!(table.is_dirty(FILE, BlockNum(2), 2));
    assert_eq!(table.stats().pinned, 1);

    busy.unpin(false);
    table.verify().unwrap();
}

#[test]
fn test_blocking_pin_waits_for_unpin() {
    let table: Arc<CacheTable<u64>> = Arc::new(CacheTable::with_buckets(8));
    let writer = table.get_and_pin(FILE, BlockNum(3), 3, PinMode::WriteExpensive, || 0);
    writer.with(|v| *v = 42);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            let pair = table.get_and_pin(FILE, BlockNum(3), 3, PinMode::Read, || 0);
            tx.send(pair.with(|v| *v)).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    writer.unpin(true);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    waiter.join().unwrap();

    let stats = table.stats();
    assert_eq!(stats.waits, 1);
    assert_eq!(stats.pinned, 0);
    assert_eq!(stats.dirty, 1);
    table.verify().unwrap();
}

#[test]
fn test_evict_keeps_pinned_pairs() {
    let table: CacheTable<u64> = CacheTable::new();
    let pinned = table.get_and_pin(FILE, BlockNum(1), 1, PinMode::Read, || 1);
    table.get_and_pin(FILE, BlockNum(2), 2, PinMode::Read, || 2).unpin(false);
    table.get_and_pin(FileId(2), BlockNum(1), 1, PinMode::Read, || 3).unpin(false);

    assert_eq!(table.evict_file(FILE), 1);
    assert_eq!(table.stats().pairs, 2);
    pinned.unpin(false);
    assert_eq!(table.evict_file(FILE), 1);
}
