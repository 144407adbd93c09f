//! Server context: node-wide replication state
//!
//! Owns the storage engine, the streaming log, the commit order monitor
//! and the session pool, and keeps the registries the applier and the
//! abort coordinator share:
//! - streaming appliers keyed by (originating node, transaction id)
//! - appliers of aborted streaming transactions waiting for the rollbacker
//! - storage transaction to session mapping used to route lock conflicts
//!
//! [`ServerContext::on_apply`] is the dispatch point for every write-set
//! the provider delivers; [`ServerContext::request_abort`] is the forced
//! abort signal.

use crate::applier::ApplierService;
use crate::config::ReplicationConfig;
use crate::service::HighPriorityService;
use crate::storage_service::StorageService;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use replicore_concurrency::{
    CommitOrder, Session, SessionMode, SessionQueue, SessionState, Transaction, TransactionState,
};
use replicore_core::{
    Gtid, ReplicationError, Result, Seqno, ServerId, TransactionId, WriteSet, WsHandle, WsMeta,
};
use replicore_storage::{ConflictHandler, MemoryEngine, StorageTrx, StreamingLog};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Applier service of an open streaming transaction
pub type StreamingApplier = Arc<Mutex<ApplierService>>;

/// Outcome of [`ServerContext::request_abort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRequest {
    /// The victim was marked for abort
    Accepted,
    /// The victim cannot be aborted in its current state
    Rejected,
}

type StreamingKey = (ServerId, TransactionId);

const RELEASE_WAIT: Duration = Duration::from_secs(5);

/// Node-wide replication state
pub struct ServerContext {
    config: ReplicationConfig,
    node_id: ServerId,
    engine: Arc<MemoryEngine>,
    streaming_log: StreamingLog,
    commit_order: CommitOrder,
    checkpoint: Mutex<Gtid>,
    next_session_id: AtomicU64,
    next_trx_id: AtomicU64,
    pool: Mutex<Vec<Arc<Session>>>,
    streaming_appliers: DashMap<StreamingKey, StreamingApplier>,
    aborted_appliers: DashMap<u64, StreamingApplier>,
    trx_sessions: DashMap<StorageTrx, Weak<Session>>,
    rollback_queue: RwLock<Option<Arc<SessionQueue>>>,
    post_rollback_queue: RwLock<Option<Arc<SessionQueue>>>,
    bf_aborts: AtomicU64,
    pending_exits: AtomicUsize,
    running_appliers: AtomicUsize,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("node_id", &self.node_id)
            .field("checkpoint", &*self.checkpoint.lock())
            .field("streaming_appliers", &self.streaming_appliers.len())
            .field("bf_aborts", &self.bf_aborts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Routes engine lock conflicts back to the server
struct ConflictRouter {
    server: Weak<ServerContext>,
}

impl ConflictHandler for ConflictRouter {
    fn on_lock_conflict(&self, requester: StorageTrx, holder: StorageTrx) {
        if let Some(server) = self.server.upgrade() {
            server.on_lock_conflict(requester, holder);
        }
    }
}

impl ServerContext {
    /// Server on top of `engine`, committed up to `position`
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `Storage` if the streaming
    /// log table cannot be created.
    pub fn new(config: ReplicationConfig, engine: Arc<MemoryEngine>, position: Gtid) -> Result<Arc<Self>> {
        config.validate()?;
        let streaming_log = StreamingLog::open(Arc::clone(&engine))?;
        let server = Arc::new(Self {
            node_id: ServerId::new(),
            engine: Arc::clone(&engine),
            streaming_log,
            commit_order: CommitOrder::new(position.seqno),
            checkpoint: Mutex::new(position),
            next_session_id: AtomicU64::new(1),
            next_trx_id: AtomicU64::new(1),
            pool: Mutex::new(Vec::new()),
            streaming_appliers: DashMap::new(),
            aborted_appliers: DashMap::new(),
            trx_sessions: DashMap::new(),
            rollback_queue: RwLock::new(None),
            post_rollback_queue: RwLock::new(None),
            bf_aborts: AtomicU64::new(0),
            pending_exits: AtomicUsize::new(0),
            running_appliers: AtomicUsize::new(0),
            config,
        });
        engine.set_conflict_handler(Arc::new(ConflictRouter {
            server: Arc::downgrade(&server),
        }));
        info!(
            target: "replicore::server",
            node = %server.node_id,
            position = %position,
            "server context ready"
        );
        Ok(server)
    }

    /// Server on a fresh in-memory engine at position 0
    pub fn in_memory(config: ReplicationConfig) -> Result<Arc<Self>> {
        let engine = Arc::new(MemoryEngine::new(config.lock_wait_timeout()));
        Self::new(config, engine, Gtid::new(ServerId::undefined(), Seqno::new(0)))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Id of this node
    pub fn node_id(&self) -> ServerId {
        self.node_id
    }

    /// Numeric server id stamped on locally written events
    pub fn numeric_id(&self) -> u32 {
        let b = self.node_id.as_bytes();
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Storage engine
    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    /// Fragment side-table
    pub fn streaming_log(&self) -> &StreamingLog {
        &self.streaming_log
    }

    /// Commit order monitor
    pub fn commit_order(&self) -> &CommitOrder {
        &self.commit_order
    }

    /// Highest position committed or skipped
    pub fn checkpoint(&self) -> Gtid {
        *self.checkpoint.lock()
    }

    pub(crate) fn advance_checkpoint(&self, gtid: Gtid) {
        let mut checkpoint = self.checkpoint.lock();
        if gtid.seqno > checkpoint.seqno {
            *checkpoint = gtid;
        }
    }

    /// Allocate a local transaction id
    pub fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.next_trx_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Forced aborts accepted so far
    pub fn bf_aborts(&self) -> u64 {
        self.bf_aborts.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Take a session from the pool, or create one
    pub fn acquire_session(&self) -> Arc<Session> {
        if let Some(session) = self.pool.lock().pop() {
            return session;
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Session::new(id))
    }

    /// Reset `session` and return it to the pool
    pub fn release_session(&self, session: Arc<Session>) {
        let stale = {
            let mut state = session.lock();
            let stale = state
                .transaction
                .as_mut()
                .and_then(|t| t.take_storage_trx());
            *state = SessionState::default();
            state.proc_info = "idle";
            stale
        };
        if let Some(stale) = stale {
            self.engine.rollback(stale);
            self.unregister_trx(stale);
        }
        debug!(target: "replicore::server", session = session.id(), "session returned to pool");
        self.pool.lock().push(session);
    }

    /// Sessions waiting in the pool
    pub fn pooled_sessions(&self) -> usize {
        self.pool.lock().len()
    }

    /// Storage service on a pooled session
    pub fn storage_service(self: &Arc<Self>) -> StorageService {
        StorageService::new(Arc::clone(self), self.acquire_session())
    }

    /// Return a storage service's session to the pool
    pub fn release_storage_service(&self, service: StorageService) {
        self.release_session(service.into_session());
    }

    /// Leave applier mode and return the applier's session to the pool
    pub fn release_high_priority_service(&self, service: ApplierService) {
        self.release_session(service.into_session());
    }

    pub(crate) fn register_trx(&self, trx: StorageTrx, session: &Arc<Session>) {
        self.trx_sessions.insert(trx, Arc::downgrade(session));
    }

    pub(crate) fn unregister_trx(&self, trx: StorageTrx) {
        self.trx_sessions.remove(&trx);
    }

    fn session_of(&self, trx: StorageTrx) -> Option<Arc<Session>> {
        self.trx_sessions.get(&trx).and_then(|w| w.upgrade())
    }

    // ========================================================================
    // Applier threads
    // ========================================================================

    /// Ask `count` applier threads to stop after their current write-set
    pub fn request_applier_exit(&self, count: usize) {
        self.pending_exits.fetch_add(count, Ordering::SeqCst);
    }

    /// Consume one pending exit request
    pub(crate) fn check_exit_status(&self) -> bool {
        self.pending_exits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn applier_started(&self) {
        self.running_appliers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn applier_exited(&self) {
        self.running_appliers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Applier threads currently running
    pub fn running_appliers(&self) -> usize {
        self.running_appliers.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Streaming appliers
    // ========================================================================

    /// Streaming applier of a transaction, if one is open
    pub fn find_streaming_applier(&self, server_id: ServerId, transaction_id: TransactionId) -> Option<StreamingApplier> {
        self.streaming_appliers
            .get(&(server_id, transaction_id))
            .map(|sa| Arc::clone(sa.value()))
    }

    /// Open streaming transactions
    pub fn streaming_applier_count(&self) -> usize {
        self.streaming_appliers.len()
    }

    /// Aborted streaming appliers not yet rolled back
    pub fn aborted_applier_count(&self) -> usize {
        self.aborted_appliers.len()
    }

    fn start_streaming_applier(self: &Arc<Self>, handle: WsHandle, meta: &WsMeta) -> Result<StreamingApplier> {
        let key = (meta.server_id, meta.transaction_id);
        if self.streaming_appliers.contains_key(&key) {
            return Err(ReplicationError::InvalidState(format!(
                "streaming applier for {}:{} already exists",
                meta.server_id, meta.transaction_id
            )));
        }
        let mut applier = ApplierService::new(Arc::clone(self), self.acquire_session());
        applier.store_globals();
        if let Err(e) = applier.start_transaction(handle, meta) {
            self.release_high_priority_service(applier);
            return Err(e);
        }
        applier.reset_globals();

        let sa = Arc::new(Mutex::new(applier));
        self.streaming_appliers.insert(key, Arc::clone(&sa));
        info!(
            target: "replicore::streaming",
            origin = %meta.server_id,
            trx = %meta.transaction_id,
            "started streaming applier"
        );
        Ok(sa)
    }

    fn stop_streaming_applier(&self, key: &StreamingKey) -> Option<StreamingApplier> {
        self.streaming_appliers.remove(key).map(|(_, sa)| sa)
    }

    pub(crate) fn take_aborted_applier(&self, session_id: u64) -> Option<StreamingApplier> {
        self.aborted_appliers.remove(&session_id).map(|(_, sa)| sa)
    }

    /// Return a streaming applier's session to the pool once no one else
    /// holds it
    pub(crate) fn release_streaming_applier(&self, sa: StreamingApplier) {
        let deadline = Instant::now() + RELEASE_WAIT;
        let mut sa = sa;
        loop {
            match Arc::try_unwrap(sa) {
                Ok(applier) => {
                    self.release_high_priority_service(applier.into_inner());
                    return;
                }
                Err(shared) => {
                    if Instant::now() >= deadline {
                        warn!(
                            target: "replicore::streaming",
                            session = shared.lock().session().id(),
                            "streaming applier still referenced, session not pooled"
                        );
                        return;
                    }
                    sa = shared;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    // ========================================================================
    // Write-set dispatch
    // ========================================================================

    /// Apply one delivered write-set through the applier thread's service
    pub(crate) fn on_apply(self: &Arc<Self>, service: &mut ApplierService, ws: &WriteSet) -> Result<()> {
        let meta = &ws.meta;
        let flags = meta.flags;
        service.store_globals();

        let result = if flags.is_toi() {
            service.apply_toi(meta, &ws.data)
        } else if flags.rolls_back() {
            self.rollback_fragment(service, ws)
        } else if flags.starts_transaction() && flags.commits() {
            self.apply_single(service, ws)
        } else if flags.starts_transaction() {
            match self.start_streaming_applier(ws.handle, meta) {
                Ok(sa) => self.apply_fragment(service, &sa, ws),
                Err(e) => {
                    service.log_dummy_write_set(ws.handle, meta)?;
                    Err(e)
                }
            }
        } else {
            match self.find_streaming_applier(meta.server_id, meta.transaction_id) {
                None => {
                    debug!(
                        target: "replicore::streaming",
                        trx = %meta.transaction_id,
                        seqno = meta.seqno().get(),
                        "no streaming applier, fragment discarded"
                    );
                    service.log_dummy_write_set(ws.handle, meta)
                }
                Some(sa) if flags.commits() => self.commit_fragment(sa, ws),
                Some(sa) => self.apply_fragment(service, &sa, ws),
            }
        };

        service.after_apply();
        service.reset_globals();
        result
    }

    fn apply_single(&self, service: &mut ApplierService, ws: &WriteSet) -> Result<()> {
        service.start_transaction(ws.handle, &ws.meta)?;
        match service.apply_write_set(&ws.meta, &ws.data) {
            Ok(()) => service.commit(ws.handle, &ws.meta),
            Err(e) => {
                service.rollback(ws.handle, &ws.meta)?;
                Err(e)
            }
        }
    }

    fn apply_fragment(&self, service: &mut ApplierService, sa: &StreamingApplier, ws: &WriteSet) -> Result<()> {
        let meta = &ws.meta;
        let mut streaming = sa.lock();
        streaming.store_globals();
        let applied = streaming.apply_write_set(meta, &ws.data);
        let still_open = streaming.session().transaction_state() == Some(TransactionState::Executing);
        streaming.after_apply();
        streaming.reset_globals();

        // the fragment is stored by the applier thread's own session
        match applied {
            Ok(()) if still_open => service.append_fragment_and_commit(ws.handle, meta, &ws.data),
            Ok(()) => {
                debug!(
                    target: "replicore::streaming",
                    trx = %meta.transaction_id,
                    "streaming applier aborted, fragment not stored"
                );
                service.log_dummy_write_set(ws.handle, meta)
            }
            Err(e) => {
                service.log_dummy_write_set(ws.handle, meta)?;
                Err(e)
            }
        }
    }

    fn commit_fragment(&self, sa: StreamingApplier, ws: &WriteSet) -> Result<()> {
        let meta = &ws.meta;
        let result = {
            let mut streaming = sa.lock();
            streaming.store_globals();
            let result = commit_streaming(&mut streaming, ws);
            if result.is_err() {
                if let Err(e) = streaming.rollback(ws.handle, meta) {
                    warn!(target: "replicore::streaming", trx = %meta.transaction_id, error = %e, "streaming rollback failed");
                }
            }
            streaming.after_apply();
            streaming.reset_globals();
            result
        };
        self.stop_streaming_applier(&(meta.server_id, meta.transaction_id));
        self.release_streaming_applier(sa);
        info!(
            target: "replicore::streaming",
            trx = %meta.transaction_id,
            seqno = meta.seqno().get(),
            ok = result.is_ok(),
            "streaming transaction finished"
        );
        result
    }

    fn rollback_fragment(&self, service: &mut ApplierService, ws: &WriteSet) -> Result<()> {
        let meta = &ws.meta;
        let Some(sa) = self.stop_streaming_applier(&(meta.server_id, meta.transaction_id)) else {
            return service.log_dummy_write_set(ws.handle, meta);
        };

        let result = {
            let mut streaming = sa.lock();
            let transaction = streaming.session().lock().transaction()?.clone();
            let removed = if transaction.fragments().is_empty() {
                service.log_dummy_write_set(ws.handle, meta)
            } else {
                remove_fragments_ordered(service, &transaction, ws)
            };
            // the rollback position was consumed above
            streaming.store_globals();
            let rolled_back = streaming.rollback(WsHandle::default(), &WsMeta::default());
            streaming.after_apply();
            streaming.reset_globals();
            removed.and(rolled_back)
        };
        self.release_streaming_applier(sa);
        info!(
            target: "replicore::streaming",
            trx = %meta.transaction_id,
            seqno = meta.seqno().get(),
            "streaming transaction rolled back"
        );
        result
    }

    /// Rebuild streaming appliers from the fragments left in the streaming
    /// log; returns how many were restored
    pub fn recover_streaming_appliers(self: &Arc<Self>) -> Result<usize> {
        let group = self.checkpoint().id;
        let mut restored = 0;
        for ((server_id, transaction_id), fragments) in self.streaming_log.recover()? {
            let Some(first) = fragments.first() else {
                continue;
            };
            if self.find_streaming_applier(server_id, transaction_id).is_some() {
                continue;
            }
            let handle = WsHandle::new(transaction_id, 0);
            let first_meta = WsMeta::new(Gtid::new(group, first.seqno), server_id, transaction_id, first.flags);
            let sa = self.start_streaming_applier(handle, &first_meta)?;
            let mut applier = sa.lock();
            applier.store_globals();
            for fragment in &fragments {
                let meta = WsMeta::new(
                    Gtid::new(group, fragment.seqno),
                    server_id,
                    transaction_id,
                    fragment.flags,
                );
                applier.apply_write_set(&meta, &fragment.payload)?;
            }
            applier.after_apply();
            applier.reset_globals();
            restored += 1;
            info!(
                target: "replicore::streaming",
                origin = %server_id,
                trx = %transaction_id,
                fragments = fragments.len(),
                "recovered streaming applier"
            );
        }
        Ok(restored)
    }

    // ========================================================================
    // Forced abort
    // ========================================================================

    pub(crate) fn install_rollback_queue(&self, queue: Option<Arc<SessionQueue>>) {
        *self.rollback_queue.write() = queue;
    }

    pub(crate) fn install_post_rollback_queue(&self, queue: Option<Arc<SessionQueue>>) {
        *self.post_rollback_queue.write() = queue;
    }

    pub(crate) fn close_rollback_queue(&self) {
        if let Some(queue) = self.rollback_queue.read().as_ref() {
            queue.close();
        }
    }

    pub(crate) fn close_post_rollback_queue(&self) {
        if let Some(queue) = self.post_rollback_queue.read().as_ref() {
            queue.close();
        }
    }

    /// Queue `victim` for the rollbacker
    ///
    /// # Errors
    ///
    /// `DuplicateAbortRequest` if the victim is already queued (nothing
    /// changes), `InvalidState` if no rollbacker is running.
    pub fn fire_rollbacker(&self, victim: &Arc<Session>) -> Result<()> {
        let queue = self.rollback_queue.read().clone();
        push_victim(queue, victim, "rollbacker")
    }

    pub(crate) fn fire_post_rollbacker(&self, victim: &Arc<Session>) -> Result<()> {
        let queue = self.post_rollback_queue.read().clone();
        push_victim(queue, victim, "post rollbacker")
    }

    /// Force `victim`'s transaction to abort on behalf of `initiator`
    ///
    /// Sessions that are not in the middle of a command are queued for the
    /// rollbacker; a session inside a command only gets its lock wait
    /// broken and rolls itself back when the command ends.
    pub fn request_abort(&self, initiator: &Session, victim: &Arc<Session>) -> AbortRequest {
        if initiator.id() == victim.id() {
            return AbortRequest::Rejected;
        }
        let (initiator_seqno, total_order) = {
            let state = initiator.lock();
            let seqno = state
                .transaction
                .as_ref()
                .map(|t| t.seqno())
                .unwrap_or_default();
            (seqno, state.mode == SessionMode::TotalOrder)
        };

        // without a rollbacker a local victim keeps MustAbort and rolls
        // itself back at its next statement
        let rollbacker_running = self.rollback_queue.read().is_some();
        let (storage, queued, high_priority, key) = {
            let mut state = victim.lock();
            let high_priority = state.mode != SessionMode::Local;
            let in_command = state.in_command;
            let Some(trx) = state.transaction.as_mut() else {
                return AbortRequest::Rejected;
            };
            if !abortable(trx, high_priority, initiator_seqno) {
                debug!(
                    target: "replicore::abort",
                    victim = victim.id(),
                    state = %trx.state(),
                    "abort request rejected"
                );
                return AbortRequest::Rejected;
            }
            let next = if trx.state() == TransactionState::Committing {
                TransactionState::MustReplay
            } else {
                TransactionState::MustAbort
            };
            if let Err(e) = trx.transition(next) {
                warn!(target: "replicore::abort", victim = victim.id(), error = %e, "abort transition failed");
                return AbortRequest::Rejected;
            }
            if total_order {
                trx.set_bf_aborted_in_total_order(true);
            }
            let queued = next == TransactionState::MustAbort
                && (high_priority || (!in_command && rollbacker_running));
            if queued {
                if let Err(e) = trx.transition(TransactionState::Aborting) {
                    warn!(target: "replicore::abort", victim = victim.id(), error = %e, "abort transition failed");
                }
            }
            (trx.storage_trx(), queued, high_priority, (trx.server_id(), trx.id()))
        };

        self.bf_aborts.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "replicore::abort",
            initiator = initiator.id(),
            victim = victim.id(),
            seqno = initiator_seqno.get(),
            queued,
            "forced abort"
        );
        if let Some(storage) = storage {
            self.engine.cancel_lock_wait(storage);
        }
        self.commit_order.interrupt();

        if queued {
            if high_priority {
                if let Some(sa) = self.stop_streaming_applier(&key) {
                    self.aborted_appliers.insert(victim.id(), sa);
                }
            }
            victim.reset_rollback_complete();
            if let Err(e) = self.fire_rollbacker(victim) {
                warn!(target: "replicore::abort", victim = victim.id(), error = %e, "victim not queued");
            }
        }
        AbortRequest::Accepted
    }

    fn on_lock_conflict(&self, requester: StorageTrx, holder: StorageTrx) {
        let (Some(initiator), Some(victim)) = (self.session_of(requester), self.session_of(holder)) else {
            debug!(target: "replicore::abort", requester, holder, "lock conflict with unknown session");
            return;
        };
        if initiator.lock().mode == SessionMode::Local {
            return;
        }
        self.request_abort(&initiator, &victim);
    }
}

/// Victim eligibility for a forced abort
fn abortable(trx: &Transaction, high_priority: bool, initiator_seqno: Seqno) -> bool {
    use TransactionState::*;
    if !matches!(trx.state(), Executing | Preparing | Certifying | Committing) {
        return false;
    }
    if high_priority {
        // only open streaming transactions of appliers can be aborted
        return trx.is_streaming() && trx.state() == Executing;
    }
    // an ordered victim ahead of the initiator commits first
    trx.is_streaming()
        || !trx.is_ordered()
        || initiator_seqno.is_undefined()
        || trx.seqno() > initiator_seqno
}

fn push_victim(queue: Option<Arc<SessionQueue>>, victim: &Arc<Session>, worker: &'static str) -> Result<()> {
    let Some(queue) = queue else {
        warn!(target: "replicore::abort", victim = victim.id(), worker, "no worker running");
        return Err(ReplicationError::InvalidState(format!("{} is not running", worker)));
    };
    match queue.push(Arc::clone(victim)) {
        Ok(()) => {
            debug!(target: "replicore::abort", victim = victim.id(), worker, "victim queued");
            Ok(())
        }
        Err(e @ ReplicationError::DuplicateAbortRequest(_)) => {
            warn!(target: "replicore::abort", victim = victim.id(), worker, "duplicate session for abort queue");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn commit_streaming(streaming: &mut ApplierService, ws: &WriteSet) -> Result<()> {
    streaming.remove_fragments(&ws.meta)?;
    streaming.apply_write_set(&ws.meta, &ws.data)?;
    streaming.commit(ws.handle, &ws.meta)
}

fn remove_fragments_ordered(service: &mut ApplierService, transaction: &Transaction, ws: &WriteSet) -> Result<()> {
    service.start_transaction(ws.handle, &ws.meta)?;
    service.adopt_transaction(transaction)?;
    match service.remove_fragments(&ws.meta) {
        Ok(()) => service.commit(ws.handle, &ws.meta),
        Err(e) => {
            service.rollback(ws.handle, &ws.meta)?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Arc<ServerContext> {
        ServerContext::in_memory(ReplicationConfig::default()).unwrap()
    }

    fn with_transaction(server: &ServerContext, mode: SessionMode, f: impl FnOnce(&mut Transaction)) -> Arc<Session> {
        let session = server.acquire_session();
        let mut state = session.lock();
        state.mode = mode;
        let mut trx = Transaction::new(server.next_transaction_id(), server.node_id());
        f(&mut trx);
        state.transaction = Some(trx);
        drop(state);
        session
    }

    fn ordered_at(trx: &mut Transaction, seqno: i64) {
        let meta = WsMeta::new(
            Gtid::new(ServerId::undefined(), Seqno::new(seqno)),
            trx.server_id(),
            trx.id(),
            Default::default(),
        );
        trx.set_ws(WsHandle::new(trx.id(), 0), meta);
    }

    #[test]
    fn test_session_pool_reuses_and_resets() {
        let server = server();
        let session = server.acquire_session();
        let id = session.id();
        session.lock().in_command = true;
        server.release_session(session);
        assert_eq!(server.pooled_sessions(), 1);

        let again = server.acquire_session();
        assert_eq!(again.id(), id);
        assert!(!again.lock().in_command);
        assert_eq!(server.pooled_sessions(), 0);
    }

    #[test]
    fn test_exit_requests_consumed_once() {
        let server = server();
        assert!(!server.check_exit_status());
        server.request_applier_exit(2);
        assert!(server.check_exit_status());
        assert!(server.check_exit_status());
        assert!(!server.check_exit_status());
    }

    #[test]
    fn test_checkpoint_only_advances() {
        let server = server();
        server.advance_checkpoint(Gtid::new(ServerId::undefined(), Seqno::new(5)));
        server.advance_checkpoint(Gtid::new(ServerId::undefined(), Seqno::new(3)));
        assert_eq!(server.checkpoint().seqno, Seqno::new(5));
    }

    #[test]
    fn test_abort_rejects_self_and_idle() {
        let server = server();
        let initiator = with_transaction(&server, SessionMode::HighPriority, |_| {});
        assert_eq!(server.request_abort(&initiator, &initiator), AbortRequest::Rejected);

        let idle = server.acquire_session();
        assert_eq!(server.request_abort(&initiator, &idle), AbortRequest::Rejected);
    }

    #[test]
    fn test_abort_rejects_victim_ordered_first() {
        let server = server();
        let initiator = with_transaction(&server, SessionMode::HighPriority, |t| ordered_at(t, 10));
        let victim = with_transaction(&server, SessionMode::Local, |t| {
            t.transition(TransactionState::Certifying).unwrap();
            ordered_at(t, 9);
        });
        assert_eq!(server.request_abort(&initiator, &victim), AbortRequest::Rejected);
        assert_eq!(victim.transaction_state(), Some(TransactionState::Certifying));
    }

    #[test]
    fn test_abort_in_command_only_marks() {
        let server = server();
        let initiator = with_transaction(&server, SessionMode::HighPriority, |t| ordered_at(t, 3));
        let victim = with_transaction(&server, SessionMode::Local, |_| {});
        victim.lock().in_command = true;

        assert_eq!(server.request_abort(&initiator, &victim), AbortRequest::Accepted);
        assert_eq!(victim.transaction_state(), Some(TransactionState::MustAbort));
        assert_eq!(server.bf_aborts(), 1);
    }

    #[test]
    fn test_abort_committing_victim_must_replay() {
        let server = server();
        let initiator = with_transaction(&server, SessionMode::HighPriority, |t| ordered_at(t, 3));
        let victim = with_transaction(&server, SessionMode::Local, |t| {
            t.transition(TransactionState::Certifying).unwrap();
            t.transition(TransactionState::Committing).unwrap();
            ordered_at(t, 4);
        });
        assert_eq!(server.request_abort(&initiator, &victim), AbortRequest::Accepted);
        assert_eq!(victim.transaction_state(), Some(TransactionState::MustReplay));
    }

    #[test]
    fn test_abort_without_rollbacker_leaves_must_abort() {
        let server = server();
        let initiator = with_transaction(&server, SessionMode::TotalOrder, |_| {});
        let victim = with_transaction(&server, SessionMode::Local, |_| {});
        assert_eq!(server.request_abort(&initiator, &victim), AbortRequest::Accepted);
        let state = victim.lock();
        let trx = state.transaction().unwrap();
        assert_eq!(trx.state(), TransactionState::MustAbort);
        assert!(trx.bf_aborted_in_total_order());
    }

    #[test]
    fn test_high_priority_victim_must_be_streaming() {
        let server = server();
        let initiator = with_transaction(&server, SessionMode::TotalOrder, |_| {});
        let applier = with_transaction(&server, SessionMode::HighPriority, |_| {});
        assert_eq!(server.request_abort(&initiator, &applier), AbortRequest::Rejected);

        let streaming = with_transaction(&server, SessionMode::HighPriority, |t| {
            t.fragment_applied(Seqno::new(1));
        });
        assert_eq!(server.request_abort(&initiator, &streaming), AbortRequest::Accepted);
    }
}
