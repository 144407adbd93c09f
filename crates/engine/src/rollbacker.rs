//! Abort coordinator: background rollback of forced-abort victims
//!
//! Two dedicated threads, each consuming its own [`SessionQueue`]:
//! - the rollbacker rolls back victims that were idle when aborted, and
//!   aborted streaming appliers
//! - the post-rollbacker finishes the replication state of local victims
//!   after their storage rollback, so the rollbacker never waits on it
//!
//! Both threads install their queue on the [`ServerContext`] before
//! [`AbortCoordinator::start`] returns and uninstall it on exit.

use crate::server::ServerContext;
use crate::service::HighPriorityService;
use parking_lot::Mutex;
use replicore_concurrency::{Session, SessionMode, SessionQueue, Transaction, TransactionState};
use replicore_core::{ReplicationError, Result, WsHandle, WsMeta};
use replicore_storage::ER_LOCK_DEADLOCK;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Handle on the rollbacker and post-rollbacker threads
pub struct AbortCoordinator {
    server: Arc<ServerContext>,
    rollbacker: Mutex<Option<JoinHandle<()>>>,
    post_rollbacker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AbortCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortCoordinator")
            .field("rollbacker", &self.rollbacker.lock().is_some())
            .field("post_rollbacker", &self.post_rollbacker.lock().is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Rollback,
    PostRollback,
}

impl AbortCoordinator {
    /// Spawn both threads; returns once their queues are installed
    ///
    /// # Errors
    ///
    /// `Io` if a thread cannot be spawned.
    pub fn start(server: &Arc<ServerContext>) -> Result<Self> {
        let post_rollbacker = spawn_worker(server, "replicore-post-rollbacker", Role::PostRollback)?;
        let rollbacker = match spawn_worker(server, "replicore-rollbacker", Role::Rollback) {
            Ok(handle) => handle,
            Err(e) => {
                server.close_post_rollback_queue();
                let _ = post_rollbacker.join();
                return Err(e);
            }
        };
        Ok(Self {
            server: Arc::clone(server),
            rollbacker: Mutex::new(Some(rollbacker)),
            post_rollbacker: Mutex::new(Some(post_rollbacker)),
        })
    }

    /// Drain and stop both threads
    ///
    /// The rollbacker goes first since it feeds the post-rollbacker.
    pub fn shutdown(&self) {
        if let Some(handle) = self.rollbacker.lock().take() {
            self.server.close_rollback_queue();
            if handle.join().is_err() {
                error!(target: "replicore::rollbacker", "rollbacker thread panicked");
            }
        }
        if let Some(handle) = self.post_rollbacker.lock().take() {
            self.server.close_post_rollback_queue();
            if handle.join().is_err() {
                error!(target: "replicore::rollbacker", "post rollbacker thread panicked");
            }
        }
    }
}

impl Drop for AbortCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(server: &Arc<ServerContext>, name: &str, role: Role) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = Arc::clone(server);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let queue = Arc::new(SessionQueue::new());
            match role {
                Role::Rollback => server.install_rollback_queue(Some(Arc::clone(&queue))),
                Role::PostRollback => server.install_post_rollback_queue(Some(Arc::clone(&queue))),
            }
            let _ = ready_tx.send(());
            match role {
                Role::Rollback => rollback_process(&server, &queue),
                Role::PostRollback => post_rollback_process(&queue),
            }
            match role {
                Role::Rollback => server.install_rollback_queue(None),
                Role::PostRollback => server.install_post_rollback_queue(None),
            }
        })?;
    ready_rx
        .recv()
        .map_err(|_| ReplicationError::InvalidState(format!("{} exited before start", name)))?;
    Ok(handle)
}

fn rollback_process(server: &Arc<ServerContext>, queue: &SessionQueue) {
    let rollbacker = server.acquire_session();
    rollbacker.store_globals();
    rollbacker.lock().proc_info = "rollbacker idle";
    info!(target: "replicore::rollbacker", session = rollbacker.id(), "rollbacker thread started");

    while let Some(victim) = queue.pop() {
        rollbacker.lock().proc_info = "rollbacker active";
        if let Err(e) = rollback_victim(server, &victim) {
            error!(
                target: "replicore::rollbacker",
                victim = victim.id(),
                error = %e,
                "background rollback failed"
            );
            victim.sync_rollback_complete();
        }
        rollbacker.lock().proc_info = "rollbacker idle";
    }

    info!(target: "replicore::rollbacker", "rollbacker thread exiting");
    server.release_session(rollbacker);
}

fn post_rollback_process(queue: &SessionQueue) {
    info!(target: "replicore::rollbacker", "post rollbacker thread started");
    while let Some(victim) = queue.pop() {
        victim.store_globals();
        {
            let mut state = victim.lock();
            match state.transaction.as_mut() {
                Some(trx) if trx.state() == TransactionState::Aborting => {
                    if let Err(e) = trx.transition(TransactionState::Aborted) {
                        warn!(target: "replicore::rollbacker", victim = victim.id(), error = %e, "post rollback failed");
                    } else {
                        debug!(target: "replicore::rollbacker", victim = victim.id(), trx = %trx.id(), "post rollback done");
                    }
                }
                _ => debug!(target: "replicore::rollbacker", victim = victim.id(), "nothing to finish"),
            }
        }
        victim.restore_globals();
    }
    info!(target: "replicore::rollbacker", "post rollbacker thread exiting");
}

/// Roll back one victim
fn rollback_victim(server: &Arc<ServerContext>, victim: &Arc<Session>) -> Result<()> {
    let snapshot = {
        let state = victim.lock();
        state.transaction.clone().map(|trx| (trx, state.mode))
    };
    let Some((transaction, mode)) = snapshot else {
        debug!(target: "replicore::rollbacker", victim = victim.id(), "victim has no transaction");
        victim.sync_rollback_complete();
        return Ok(());
    };
    let high_priority = mode != SessionMode::Local;

    if transaction.state() == TransactionState::Aborted {
        debug!(target: "replicore::rollbacker", victim = victim.id(), "victim already aborted");
        if let Some(sa) = server.take_aborted_applier(victim.id()) {
            server.release_streaming_applier(sa);
        }
        victim.sync_rollback_complete();
        return Ok(());
    }

    if transaction.is_streaming() && transaction.bf_aborted_in_total_order() {
        if high_priority {
            debug!(target: "replicore::rollbacker", victim = victim.id(), "rolling back applier aborted in total order");
            rollback_applier(server, victim, None)
        } else {
            debug!(target: "replicore::rollbacker", victim = victim.id(), "rolling back client aborted in total order");
            victim.store_globals();
            let result = rollback_client(server, victim);
            victim.restore_globals();
            victim.sync_rollback_complete();
            result
        }
    } else if high_priority {
        debug!(target: "replicore::rollbacker", victim = victim.id(), "rolling back streaming applier");
        rollback_applier(server, victim, Some(&transaction))
    } else {
        debug!(target: "replicore::rollbacker", victim = victim.id(), trx = %transaction.id(), "rolling back local transaction");
        let removed = if transaction.is_streaming() {
            remove_fragments(server, &transaction)
        } else {
            Ok(())
        };
        victim.store_globals();
        let rolled_back = rollback_client(server, victim);
        victim.restore_globals();
        victim.sync_rollback_complete();
        removed.and(rolled_back)
    }
}

/// Roll back an aborted streaming applier, removing its fragments first
/// when `fragments_of` is given
fn rollback_applier(server: &Arc<ServerContext>, victim: &Arc<Session>, fragments_of: Option<&Transaction>) -> Result<()> {
    let sa = server.take_aborted_applier(victim.id()).ok_or_else(|| {
        ReplicationError::InternalInconsistency(format!(
            "no applier service for high priority victim {}",
            victim.id()
        ))
    })?;
    let result = {
        let mut service = sa.lock();
        let removed = match fragments_of {
            Some(transaction) => remove_fragments(server, transaction),
            None => Ok(()),
        };
        service.store_globals();
        let rolled_back = service.rollback(WsHandle::default(), &WsMeta::default());
        service.after_apply();
        service.reset_globals();
        removed.and(rolled_back)
    };
    server.release_streaming_applier(sa);
    result
}

/// Delete a victim's fragments in a separate storage transaction
fn remove_fragments(server: &Arc<ServerContext>, transaction: &Transaction) -> Result<()> {
    let mut storage = server.storage_service();
    storage.store_globals();
    let result = storage
        .adopt_transaction(transaction)
        .and_then(|_| storage.remove_fragments())
        .and_then(|_| storage.commit(WsHandle::new(transaction.id(), 0), &WsMeta::default()));
    if result.is_err() {
        if let Err(e) = storage.rollback() {
            warn!(
                target: "replicore::rollbacker",
                trx = %transaction.id(),
                error = %e,
                "fragment removal rollback failed"
            );
        }
    }
    storage.reset_globals();
    server.release_storage_service(storage);
    result
}

/// Storage rollback of a local victim; the replication state is finished
/// by the post-rollbacker
fn rollback_client(server: &ServerContext, victim: &Arc<Session>) -> Result<()> {
    let storage = {
        let mut state = victim.lock();
        state.proc_info = "rolling back";
        let trx = state.transaction_mut()?;
        if trx.state() != TransactionState::Aborting {
            trx.transition(TransactionState::Aborting)?;
        }
        let storage = trx.take_storage_trx();
        state.mdl.release_transactional_locks();
        state.diagnostics.set_error(
            ER_LOCK_DEADLOCK,
            "Deadlock found when trying to get lock; try restarting transaction",
        );
        storage
    };
    if let Some(storage) = storage {
        server.engine().rollback(storage);
        server.unregister_trx(storage);
    }
    if let Err(e) = server.fire_post_rollbacker(victim) {
        debug!(target: "replicore::rollbacker", victim = victim.id(), error = %e, "post rollback not queued");
    }
    Ok(())
}
