//! CacheTable: pinned pairs over a partitioned bucket-mutex table
//!
//! Pairs are identified by `(file, key)` and live in bucket
//! `fullhash % bucket_count`. Pinning takes the bucket mutex only long
//! enough to look the pair up and update its pin state.
//!
//! # Deadlock avoidance
//!
//! A caller that already holds pins (or other locks) must not block on a
//! pair while keeping them. [`CacheTable::get_and_pin_nonblocking`] takes
//! the locks the caller holds as a list of [`Unlocker`]s. On conflict it
//! releases the bucket mutex first, then runs every unlocker that is still
//! locked, then returns [`PinOutcome::TryAgain`]. The caller restarts its
//! operation from the top. Unlockers never run under a bucket mutex: an
//! unlocker may need that same bucket.

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Default number of bucket mutexes
pub const DEFAULT_BUCKETS: usize = 64;

/// Identifier of a cached file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

/// Block number within a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockNum(pub u64);

/// Requested pin mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Shared
    Read,
    /// Exclusive, held briefly
    WriteCheap,
    /// Exclusive, may be held across expensive work
    WriteExpensive,
}

impl PinMode {
    fn is_write(self) -> bool {
        !matches!(self, PinMode::Read)
    }
}

/// A lock held by the caller that can be released on its behalf
pub struct Unlocker<'a> {
    release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> Unlocker<'a> {
    /// Unlocker that runs `release` when invoked
    pub fn new(release: impl FnOnce() + Send + 'a) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// True until the unlocker has run
    pub fn is_locked(&self) -> bool {
        self.release.is_some()
    }

    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Unlocker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unlocker")
            .field("locked", &self.is_locked())
            .finish()
    }
}

struct Pair<V> {
    fullhash: u32,
    value: Arc<Mutex<V>>,
    readers: usize,
    writer: Option<PinMode>,
    dirty: bool,
}

impl<V> Pair<V> {
    fn compatible(&self, mode: PinMode) -> bool {
        if mode.is_write() {
            self.writer.is_none() && self.readers == 0
        } else {
            self.writer.is_none()
        }
    }

    fn pin(&mut self, mode: PinMode) {
        if mode.is_write() {
            self.writer = Some(mode);
        } else {
            self.readers += 1;
        }
    }

    fn is_pinned(&self) -> bool {
        self.writer.is_some() || self.readers > 0
    }
}

struct Bucket<V> {
    pairs: Mutex<FxHashMap<(FileId, BlockNum), Pair<V>>>,
    unpinned: Condvar,
}

/// Counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Pairs resident
    pub pairs: usize,
    /// Pairs with at least one pin
    pub pinned: usize,
    /// Pairs marked dirty
    pub dirty: usize,
    /// Fetch callbacks run
    pub fetches: u64,
    /// Nonblocking pins that returned TryAgain
    pub try_again: u64,
    /// Blocking pins that had to wait
    pub waits: u64,
}

/// Outcome of a nonblocking pin
#[derive(Debug)]
pub enum PinOutcome<'t, V> {
    /// The pair is pinned
    Pinned(PinnedPair<'t, V>),
    /// The pair was busy; unlockers ran and the caller must retry
    TryAgain,
}

/// A pinned pair; release it with [`PinnedPair::unpin`]
///
/// Dropping a pinned pair unpins it clean.
pub struct PinnedPair<'t, V> {
    table: &'t CacheTable<V>,
    file: FileId,
    key: BlockNum,
    fullhash: u32,
    mode: PinMode,
    value: Arc<Mutex<V>>,
    released: bool,
}

impl<'t, V> PinnedPair<'t, V> {
    /// Block number of the pair
    pub fn key(&self) -> BlockNum {
        self.key
    }

    /// Mode the pair is pinned in
    pub fn mode(&self) -> PinMode {
        self.mode
    }

    /// Run `f` with the cached value
    pub fn with<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        f(&mut self.value.lock())
    }

    /// Release the pin, marking the pair dirty if requested
    pub fn unpin(mut self, dirty: bool) {
        self.release(dirty);
    }

    fn release(&mut self, dirty: bool) {
        if self.released {
            return;
        }
        self.released = true;
        self.table
            .unpin_raw(self.file, self.key, self.fullhash, self.mode, dirty);
    }
}

impl<V> Drop for PinnedPair<'_, V> {
    fn drop(&mut self) {
        self.release(false);
    }
}

impl<V> std::fmt::Debug for PinnedPair<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPair")
            .field("file", &self.file)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Partitioned table of cached pairs
pub struct CacheTable<V> {
    buckets: Box<[Bucket<V>]>,
    fetches: AtomicU64,
    try_again: AtomicU64,
    waits: AtomicU64,
}

impl<V> CacheTable<V> {
    /// Table with [`DEFAULT_BUCKETS`] bucket mutexes
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    /// Table with `count` bucket mutexes (at least one)
    pub fn with_buckets(count: usize) -> Self {
        let buckets = (0..count.max(1))
            .map(|_| Bucket {
                pairs: Mutex::new(FxHashMap::default()),
                unpinned: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            fetches: AtomicU64::new(0),
            try_again: AtomicU64::new(0),
            waits: AtomicU64::new(0),
        }
    }

    /// Number of bucket mutexes
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, fullhash: u32) -> &Bucket<V> {
        &self.buckets[fullhash as usize % self.buckets.len()]
    }

    fn pin_locked<'t>(
        &'t self,
        pairs: &mut MutexGuard<'_, FxHashMap<(FileId, BlockNum), Pair<V>>>,
        file: FileId,
        key: BlockNum,
        fullhash: u32,
        mode: PinMode,
    ) -> Option<PinnedPair<'t, V>> {
        let pair = pairs.get_mut(&(file, key))?;
        pair.pin(mode);
        Some(PinnedPair {
            table: self,
            file,
            key,
            fullhash,
            mode,
            value: Arc::clone(&pair.value),
            released: false,
        })
    }

    /// Run `fetch` with the bucket mutex released, then install the value
    /// unless another thread installed the pair in the meantime
    fn insert_fetched(
        &self,
        pairs: &mut MutexGuard<'_, FxHashMap<(FileId, BlockNum), Pair<V>>>,
        file: FileId,
        key: BlockNum,
        fullhash: u32,
        fetch: impl FnOnce() -> V,
    ) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let value = MutexGuard::unlocked(pairs, fetch);
        pairs.entry((file, key)).or_insert_with(|| Pair {
            fullhash,
            value: Arc::new(Mutex::new(value)),
            readers: 0,
            writer: None,
            dirty: false,
        });
    }

    /// Pin a pair, waiting for conflicting pins to go away
    ///
    /// `fetch` produces the value when the pair is not resident; it runs
    /// again if the pair is evicted while we wait. It runs without the
    /// bucket mutex, so it may pin other pairs.
    pub fn get_and_pin(
        &self,
        file: FileId,
        key: BlockNum,
        fullhash: u32,
        mode: PinMode,
        mut fetch: impl FnMut() -> V,
    ) -> PinnedPair<'_, V> {
        let bucket = self.bucket(fullhash);
        let mut pairs = bucket.pairs.lock();
        let mut waited = false;
        loop {
            let ready = match pairs.get(&(file, key)) {
                None => {
                    // the bucket was unlocked during the fetch
                    self.insert_fetched(&mut pairs, file, key, fullhash, &mut fetch);
                    continue;
                }
                Some(pair) => pair.compatible(mode),
            };
            if ready {
                if let Some(pinned) = self.pin_locked(&mut pairs, file, key, fullhash, mode) {
                    return pinned;
                }
                continue;
            }
            if !waited {
                waited = true;
                self.waits.fetch_add(1, Ordering::Relaxed);
            }
            bucket.unpinned.wait(&mut pairs);
        }
    }

    /// Pin a pair without ever blocking on another pin
    ///
    /// On conflict the bucket mutex is released, every still-locked
    /// unlocker runs exactly once, and `TryAgain` is returned. As with
    /// [`CacheTable::get_and_pin`], `fetch` runs without the bucket mutex.
    pub fn get_and_pin_nonblocking<'t>(
        &'t self,
        file: FileId,
        key: BlockNum,
        fullhash: u32,
        mode: PinMode,
        fetch: impl FnOnce() -> V,
        unlockers: &mut [Unlocker<'_>],
    ) -> PinOutcome<'t, V> {
        let bucket = self.bucket(fullhash);
        let mut pairs = bucket.pairs.lock();
        if !pairs.contains_key(&(file, key)) {
            self.insert_fetched(&mut pairs, file, key, fullhash, fetch);
        }
        let busy = pairs
            .get(&(file, key))
            .map_or(false, |pair| !pair.compatible(mode));

        if busy {
            drop(pairs);
            for unlocker in unlockers.iter_mut().filter(|u| u.is_locked()) {
                unlocker.run();
            }
            self.try_again.fetch_add(1, Ordering::Relaxed);
            trace!(target: "replicore::cachetable", key = key.0, fullhash, "pin conflict, try again");
            return PinOutcome::TryAgain;
        }

        match self.pin_locked(&mut pairs, file, key, fullhash, mode) {
            Some(pinned) => PinOutcome::Pinned(pinned),
            None => PinOutcome::TryAgain,
        }
    }

    fn unpin_raw(&self, file: FileId, key: BlockNum, fullhash: u32, mode: PinMode, dirty: bool) {
        let bucket = self.bucket(fullhash);
        let mut pairs = bucket.pairs.lock();
        if let Some(pair) = pairs.get_mut(&(file, key)) {
            if mode.is_write() {
                pair.writer = None;
            } else {
                pair.readers = pair.readers.saturating_sub(1);
            }
            pair.dirty |= dirty;
        }
        drop(pairs);
        bucket.unpinned.notify_all();
    }

    /// Drop every unpinned pair of `file`; returns how many were dropped
    pub fn evict_file(&self, file: FileId) -> usize {
        let mut evicted = 0;
        for bucket in self.buckets.iter() {
            let mut pairs = bucket.pairs.lock();
            let before = pairs.len();
            pairs.retain(|(f, _), pair| *f != file || pair.is_pinned());
            evicted += before - pairs.len();
        }
        evicted
    }

    /// True if the pair is resident and dirty
    pub fn is_dirty(&self, file: FileId, key: BlockNum, fullhash: u32) -> bool {
        self.bucket(fullhash)
            .pairs
            .lock()
            .get(&(file, key))
            .map_or(false, |pair| pair.dirty)
    }

    /// Check structural invariants
    ///
    /// Every pair must sit in the bucket its hash selects, and a write pin
    /// excludes readers.
    pub fn verify(&self) -> Result<(), String> {
        for (index, bucket) in self.buckets.iter().enumerate() {
            let pairs = bucket.pairs.lock();
            for ((file, key), pair) in pairs.iter() {
                if pair.fullhash as usize % self.buckets.len() != index {
                    return Err(format!(
                        "pair {:?}/{:?} with hash {} found in bucket {}",
                        file, key, pair.fullhash, index
                    ));
                }
                if pair.writer.is_some() && pair.readers > 0 {
                    return Err(format!(
                        "pair {:?}/{:?} has a writer and {} readers",
                        file, key, pair.readers
                    ));
                }
            }
        }
        Ok(())
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            try_again: self.try_again.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for bucket in self.buckets.iter() {
            let pairs = bucket.pairs.lock();
            stats.pairs += pairs.len();
            stats.pinned += pairs.values().filter(|p| p.is_pinned()).count();
            stats.dirty += pairs.values().filter(|p| p.dirty).count();
        }
        stats
    }
}

impl<V> Default for CacheTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for CacheTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTable")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
