//! Replayer service: re-applies a local transaction that lost a conflict
//! after certification
//!
//! The replayer borrows the victim's own session. On construction it
//! shadows an OK diagnostics result, releases explicit table locks and
//! enters high-priority mode; [`ReplayerService::finish`] converts the
//! provider's replay status into the client's result before the session is
//! handed back.

use crate::server::ServerContext;
use crate::service::{HighPriorityService, ServiceCore};
use replicore_concurrency::{OptionBits, Session, Transaction, TransactionState};
use replicore_core::{
    DiagnosticsStatus, ProviderStatus, ReplicationError, Result, WsFlags, WsHandle, WsMeta,
};
use replicore_storage::ER_LOCK_DEADLOCK;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// High-priority service driving a replay on the victim's session
#[derive(Debug)]
pub struct ReplayerService {
    core: ServiceCore,
    da_shadow: DiagnosticsStatus,
}

impl ReplayerService {
    /// Prepare `session` for replay
    pub fn new(server: Arc<ServerContext>, session: Arc<Session>) -> Self {
        let da_shadow = {
            let mut state = session.lock();
            let shadow = match state.diagnostics.status() {
                ok @ DiagnosticsStatus::Ok { .. } => ok.clone(),
                _ => DiagnosticsStatus::Empty,
            };
            state.diagnostics.reset();

            if state.mdl.has_explicit_locks()
                || state.attrs.option_bits.contains(OptionBits::TABLE_LOCK)
            {
                warn!(
                    target: "replicore::replayer",
                    session = session.id(),
                    "releasing table lock for replaying"
                );
                state.mdl.release_explicit_locks();
                state.attrs.option_bits.remove(OptionBits::TABLE_LOCK);
            }
            shadow
        };

        let core = ServiceCore::new(server, session);
        core.set_proc_info("replaying trx");
        Self { core, da_shadow }
    }

    /// The victim's session
    pub fn session(&self) -> &Arc<Session> {
        self.core.session()
    }

    /// Turn the replay status into the client's result
    ///
    /// # Errors
    ///
    /// `CertificationConflict` if certification failed during replay (the
    /// client sees a deadlock), `InternalInconsistency` for any other
    /// non-success status.
    pub fn finish(self, status: ProviderStatus) -> Result<()> {
        let session = Arc::clone(self.core.session());
        let trx_id = session
            .lock()
            .transaction
            .as_ref()
            .map(|t| t.id())
            .unwrap_or_default();

        let result = match status {
            ProviderStatus::Success => {
                session.reset_kill();
                let mut state = session.lock();
                match &self.da_shadow {
                    DiagnosticsStatus::Ok {
                        affected_rows,
                        last_insert_id,
                        message,
                    } => state
                        .diagnostics
                        .set_ok(*affected_rows, *last_insert_id, message.clone()),
                    _ => state.diagnostics.set_ok(0, 0, ""),
                }
                info!(target: "replicore::replayer", trx = %trx_id, "replay succeeded");
                Ok(())
            }
            ProviderStatus::CertificationFailed => {
                session.lock().diagnostics.set_error(
                    ER_LOCK_DEADLOCK,
                    "Deadlock found when trying to get lock; try restarting transaction",
                );
                info!(target: "replicore::replayer", trx = %trx_id, "replay failed certification");
                Err(ReplicationError::CertificationConflict(trx_id))
            }
            other => {
                error!(
                    target: "replicore::replayer",
                    trx = %trx_id,
                    status = %other,
                    "trx replay failed"
                );
                Err(ReplicationError::InternalInconsistency(format!(
                    "replay of transaction {} failed: {}",
                    trx_id, other
                )))
            }
        };
        drop(self);
        result
    }

    fn replay_stored_fragments(&mut self) -> Result<()> {
        let (streaming, server_id, transaction_id, applied) = self.core.streaming_identity()?;
        if !streaming {
            return Err(ReplicationError::InternalInconsistency(format!(
                "transaction {} replays a fragment but is not streaming",
                transaction_id
            )));
        }
        let stored = self
            .core
            .server
            .streaming_log()
            .fragments(server_id, transaction_id)?;
        for fragment in stored.iter().filter(|f| applied.contains(&f.seqno)) {
            let mut meta = WsMeta::default();
            meta.gtid.seqno = fragment.seqno;
            meta.server_id = fragment.server_id;
            meta.transaction_id = fragment.transaction_id;
            meta.flags = fragment.flags;
            meta.flags.remove(WsFlags::COMMIT);
            self.core.run_apply_loop(&meta, &fragment.payload)?;
            debug!(
                target: "replicore::replayer",
                trx = %transaction_id,
                seqno = fragment.seqno.get(),
                "re-applied stored fragment"
            );
        }
        Ok(())
    }
}

impl HighPriorityService for ReplayerService {
    fn start_transaction(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        self.core.start_transaction(handle, meta)
    }

    fn adopt_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        self.core.adopt_transaction(transaction)
    }

    fn apply_write_set(&mut self, meta: &WsMeta, data: &[u8]) -> Result<()> {
        self.core.require_state(TransactionState::Replaying)?;
        if !meta.flags.starts_transaction() {
            self.replay_stored_fragments()?;
        }
        self.core.run_apply_loop(meta, data)?;
        self.core.mark_fragment(meta)
    }

    fn append_fragment_and_commit(&mut self, _handle: WsHandle, _meta: &WsMeta, _data: &[u8]) -> Result<()> {
        Err(ReplicationError::InvalidState(
            "replayer does not store fragments".into(),
        ))
    }

    fn remove_fragments(&mut self, meta: &WsMeta) -> Result<()> {
        self.core.remove_fragments(meta)
    }

    fn commit(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        // replayed fragments leave the streaming log with the commit
        let (streaming, _, _, applied) = self.core.streaming_identity()?;
        if streaming && !applied.is_empty() {
            self.core.remove_fragments(meta)?;
        }
        self.core.commit(handle, meta)
    }

    fn rollback(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        self.core.rollback(handle, meta)
    }

    fn apply_toi(&mut self, _meta: &WsMeta, _data: &[u8]) -> Result<()> {
        Err(ReplicationError::InvalidState(
            "replayer does not apply total order actions".into(),
        ))
    }

    fn log_dummy_write_set(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        self.core.log_dummy_write_set(handle, meta)
    }

    fn after_apply(&mut self) {
        self.core.set_proc_info("replayed trx");
    }

    fn store_globals(&mut self) {
        self.core.store_globals();
    }

    fn reset_globals(&mut self) {
        self.core.reset_globals();
    }

    fn must_exit(&self) -> bool {
        false
    }

    fn is_replaying(&self) -> bool {
        true
    }
}
