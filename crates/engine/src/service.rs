//! High-priority service: the provider's upcall surface
//!
//! [`HighPriorityService`] is implemented by the applier
//! ([`crate::ApplierService`]) and the replayer
//! ([`crate::ReplayerService`]). Both wrap a [`ServiceCore`] that owns the
//! session's [`HighPriorityContext`] and carries the operations the two
//! share: transaction start and adoption, ordered commit, rollback,
//! fragment bookkeeping and total-order apply. They differ only in how a
//! write-set is applied.

use crate::apply::{apply_events, dump_write_set, AppliedEvents};
use crate::high_priority::{setup_key_checks, HighPriorityContext, NonTransMode};
use crate::server::ServerContext;
use replicore_concurrency::{OptionBits, Session, Transaction, TransactionState};
use replicore_core::{
    ApplyErrorBuffer, ReplicationError, Result, ServerId, TransactionId, WsHandle, WsMeta,
};
use replicore_storage::{Fragment, StorageTrx, TrxOptions, ER_UNKNOWN};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Operations the provider drives on a high-priority session
pub trait HighPriorityService {
    /// Begin a transaction at the position in `meta` (may be undefined)
    fn start_transaction(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()>;

    /// Take over identity and fragments of `transaction`
    fn adopt_transaction(&mut self, transaction: &Transaction) -> Result<()>;

    /// Apply the events of one write-set
    fn apply_write_set(&mut self, meta: &WsMeta, data: &[u8]) -> Result<()>;

    /// Store a fragment in the streaming log in its own ordered transaction
    fn append_fragment_and_commit(&mut self, handle: WsHandle, meta: &WsMeta, data: &[u8]) -> Result<()>;

    /// Delete the applied fragments of the current transaction
    fn remove_fragments(&mut self, meta: &WsMeta) -> Result<()>;

    /// Commit the current transaction
    fn commit(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()>;

    /// Roll back the current transaction
    fn rollback(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()>;

    /// Apply a total-order (isolated) action
    fn apply_toi(&mut self, meta: &WsMeta, data: &[u8]) -> Result<()>;

    /// Consume a position without applying anything
    fn log_dummy_write_set(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()>;

    /// Clean up after a write-set was processed
    fn after_apply(&mut self);

    /// Make the calling thread the owner of the session
    fn store_globals(&mut self);

    /// Give up session ownership
    fn reset_globals(&mut self);

    /// The owning thread should stop
    fn must_exit(&self) -> bool;

    /// True for the replayer
    fn is_replaying(&self) -> bool;
}

/// Move a transaction to `Aborted` through `Aborting`
pub(crate) fn finish_rollback(trx: &mut Transaction) -> Result<()> {
    match trx.state() {
        TransactionState::Aborted => Ok(()),
        TransactionState::Aborting => trx.transition(TransactionState::Aborted),
        _ => {
            trx.transition(TransactionState::Aborting)?;
            trx.transition(TransactionState::Aborted)
        }
    }
}

/// State and operations shared by the applier and the replayer
#[derive(Debug)]
pub(crate) struct ServiceCore {
    pub(crate) server: Arc<ServerContext>,
    pub(crate) ctx: HighPriorityContext,
    pub(crate) error: ApplyErrorBuffer,
}

impl ServiceCore {
    pub(crate) fn new(server: Arc<ServerContext>, session: Arc<Session>) -> Self {
        let ctx = HighPriorityContext::new(session, server.config());
        let error = ApplyErrorBuffer::new(server.config().error_buffer_size);
        Self { server, ctx, error }
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        self.ctx.session()
    }

    pub(crate) fn set_proc_info(&self, info: &'static str) {
        self.session().lock().proc_info = info;
    }

    fn storage_options(&self) -> TrxOptions {
        let config = self.server.config();
        TrxOptions {
            high_priority: true,
            idempotent: config.idempotent_apply,
            unique_checks: config.unique_key_checks,
        }
    }

    fn begin_storage(&self) -> StorageTrx {
        let trx = self.server.engine().begin(self.storage_options());
        self.server.register_trx(trx, self.session());
        trx
    }

    fn rollback_storage(&self, trx: StorageTrx) {
        self.server.engine().rollback(trx);
        self.server.unregister_trx(trx);
    }

    pub(crate) fn require_state(&self, expected: TransactionState) -> Result<()> {
        let state = self.session().lock();
        let actual = state.transaction()?.state();
        if actual != expected {
            return Err(ReplicationError::InvalidState(format!(
                "expected transaction in {}, found {}",
                expected, actual
            )));
        }
        Ok(())
    }

    fn storage_trx(&self) -> Result<StorageTrx> {
        self.session()
            .lock()
            .transaction()?
            .storage_trx()
            .ok_or_else(|| ReplicationError::InvalidState("no storage transaction".into()))
    }

    pub(crate) fn start_transaction(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        setup_key_checks(self.session(), self.server.config());
        let storage = self.begin_storage();
        let stale = {
            let mut state = self.session().lock();
            match state.transaction.as_mut() {
                // a replaying victim keeps its transaction, only storage is new
                Some(trx)
                    if trx.id() == meta.transaction_id
                        && trx.state() == TransactionState::Replaying =>
                {
                    trx.set_ws(handle, *meta);
                    let old = trx.take_storage_trx();
                    trx.set_storage_trx(Some(storage));
                    old
                }
                _ => {
                    let mut trx = Transaction::new(meta.transaction_id, meta.server_id);
                    trx.set_ws(handle, *meta);
                    trx.set_storage_trx(Some(storage));
                    state
                        .transaction
                        .replace(trx)
                        .and_then(|mut old| old.take_storage_trx())
                }
            }
        };
        if let Some(stale) = stale {
            self.rollback_storage(stale);
        }
        trace!(
            target: "replicore::applier",
            session = self.session().id(),
            trx = %meta.transaction_id,
            seqno = meta.seqno().get(),
            "transaction started"
        );
        Ok(())
    }

    pub(crate) fn adopt_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        let (needs_storage, stale) = {
            let mut state = self.session().lock();
            let same = matches!(
                &state.transaction,
                Some(t) if t.id() == transaction.id() && t.server_id() == transaction.server_id()
            );
            let mut stale = None;
            if !same {
                let mut trx = Transaction::new(transaction.id(), transaction.server_id());
                trx.set_ws(transaction.handle(), *transaction.meta());
                stale = state
                    .transaction
                    .replace(trx)
                    .and_then(|mut old| old.take_storage_trx());
            }
            let trx = state.transaction_mut()?;
            for seqno in transaction.fragments() {
                if !trx.fragments().contains(seqno) {
                    trx.fragment_applied(*seqno);
                }
            }
            trx.set_streaming(trx.is_streaming() || transaction.is_streaming());
            (trx.storage_trx().is_none(), stale)
        };
        if let Some(stale) = stale {
            self.rollback_storage(stale);
        }
        if needs_storage {
            let storage = self.begin_storage();
            self.session()
                .lock()
                .transaction_mut()?
                .set_storage_trx(Some(storage));
        }
        debug!(
            target: "replicore::applier",
            session = self.session().id(),
            trx = %transaction.id(),
            fragments = transaction.fragments().len(),
            "adopted transaction"
        );
        Ok(())
    }

    /// Run the apply loop with dump and error-buffer handling
    pub(crate) fn run_apply_loop(&mut self, meta: &WsMeta, data: &[u8]) -> Result<AppliedEvents> {
        setup_key_checks(self.session(), self.server.config());
        let result = apply_events(self.server.engine(), self.session(), self.ctx.rli(), data);

        let ignored = std::mem::take(&mut self.session().lock().has_ignored_error);
        if result.is_err() || ignored {
            dump_write_set(
                self.server.config().dump_dir.as_deref(),
                self.session().id(),
                meta.seqno(),
                data,
            );
        }
        if let Err(e) = &result {
            let mut state = self.ctx.session().lock();
            if !state.diagnostics.is_error() {
                state
                    .diagnostics
                    .set_error(e.code().unwrap_or(ER_UNKNOWN), e.to_string());
            }
            self.error.store(&state.diagnostics);
        }
        result
    }

    /// Record the write-set as an applied fragment unless it commits
    pub(crate) fn mark_fragment(&self, meta: &WsMeta) -> Result<()> {
        if !meta.flags.commits() {
            self.session()
                .lock()
                .transaction_mut()?
                .fragment_applied(meta.seqno());
        }
        Ok(())
    }

    pub(crate) fn append_fragment_and_commit(
        &mut self,
        handle: WsHandle,
        meta: &WsMeta,
        data: &[u8],
    ) -> Result<()> {
        self.start_transaction(handle, meta)?;
        let storage = self.storage_trx()?;
        let fragment = Fragment {
            server_id: meta.server_id,
            transaction_id: meta.transaction_id,
            seqno: meta.seqno(),
            flags: meta.flags,
            payload: data.to_vec(),
        };
        if let Err(e) = self.server.streaming_log().append(storage, &fragment) {
            self.rollback(handle, meta)?;
            return Err(e.into());
        }
        self.commit(handle, meta)
    }

    pub(crate) fn remove_fragments(&mut self, meta: &WsMeta) -> Result<()> {
        let (storage, server_id, transaction_id, fragments) = {
            let state = self.session().lock();
            let trx = state.transaction()?;
            let storage = trx
                .storage_trx()
                .ok_or_else(|| ReplicationError::InvalidState("no storage transaction".into()))?;
            (storage, trx.server_id(), trx.id(), trx.fragments().to_vec())
        };
        let removed = self
            .server
            .streaming_log()
            .remove(storage, server_id, transaction_id, &fragments)?;
        debug!(
            target: "replicore::applier",
            trx = %transaction_id,
            seqno = meta.seqno().get(),
            removed,
            "removed fragments"
        );
        Ok(())
    }

    pub(crate) fn commit(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        let ordered = meta.is_ordered();
        {
            let mut state = self.session().lock();
            state.proc_info = "committing";
            let trx = state.transaction_mut()?;
            trx.set_ws(handle, *meta);
            trx.transition(TransactionState::Committing)?;
        }

        if ordered {
            self.server.commit_order().enter(meta.seqno(), || false);
            self.session()
                .lock()
                .transaction_mut()?
                .transition(TransactionState::OrderedCommit)?;
        }

        let (storage, logged) = {
            let mut state = self.session().lock();
            let logged = state.attrs.option_bits.contains(OptionBits::BIN_LOG);
            (state.transaction_mut()?.take_storage_trx(), logged)
        };
        if let Some(storage) = storage {
            let result = self.server.engine().commit(storage, logged);
            self.server.unregister_trx(storage);
            if let Err(e) = result {
                error!(target: "replicore::applier", seqno = meta.seqno().get(), error = %e, "storage commit failed");
                return Err(ReplicationError::InternalInconsistency(format!(
                    "storage commit failed at seqno {}: {}",
                    meta.seqno(),
                    e
                )));
            }
        }

        {
            let mut state = self.session().lock();
            let trx = state.transaction_mut()?;
            if ordered {
                trx.transition(TransactionState::Committed)?;
            } else {
                // never ordered, so only the replication state is cleaned up
                finish_rollback(trx)?;
            }
            state.apply_format = None;
            state.gtid_next = None;
            state.mdl.release_transactional_locks();
            state.proc_info = "applier committed";
        }

        if ordered {
            self.server.commit_order().leave(meta.seqno());
            self.server.advance_checkpoint(meta.gtid);
        }
        trace!(target: "replicore::applier", seqno = meta.seqno().get(), ordered, "committed");
        Ok(())
    }

    pub(crate) fn rollback(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        let storage = {
            let mut state = self.session().lock();
            state.proc_info = "rolling back";
            let storage = match state.transaction.as_mut() {
                Some(trx) => {
                    if meta.is_ordered() {
                        trx.set_ws(handle, *meta);
                    }
                    finish_rollback(trx)?;
                    trx.take_storage_trx()
                }
                None => None,
            };
            state.mdl.release_transactional_locks();
            state.mdl.release_explicit_locks();
            state.apply_format = None;
            storage
        };
        if let Some(storage) = storage {
            self.rollback_storage(storage);
        }
        if meta.is_ordered() {
            self.server.commit_order().skip(meta.seqno());
            self.server.advance_checkpoint(meta.gtid);
        }
        debug!(
            target: "replicore::applier",
            session = self.session().id(),
            seqno = meta.seqno().get(),
            "rolled back"
        );
        Ok(())
    }

    pub(crate) fn apply_toi(&mut self, meta: &WsMeta, data: &[u8]) -> Result<()> {
        let session = Arc::clone(self.session());
        let _mode = NonTransMode::new(&session, meta);
        session.lock().proc_info = "applier toi";
        debug!(target: "replicore::applier", seqno = meta.seqno().get(), "applying total order action");

        let ordered = meta.is_ordered();
        if ordered {
            self.server.commit_order().enter(meta.seqno(), || false);
        }

        let storage = self.begin_storage();
        {
            let mut trx = Transaction::new(meta.transaction_id, meta.server_id);
            trx.set_ws(WsHandle::new(meta.transaction_id, 0), *meta);
            trx.set_storage_trx(Some(storage));
            session.lock().transaction = Some(trx);
        }

        let result = self.run_apply_loop(meta, data).map(|_| ());

        let logged = session
            .lock()
            .attrs
            .option_bits
            .contains(OptionBits::BIN_LOG);
        if let Err(e) = self.server.engine().commit(storage, logged) {
            error!(target: "replicore::applier", seqno = meta.seqno().get(), error = %e, "total order commit failed");
        }
        self.server.unregister_trx(storage);
        {
            let mut state = session.lock();
            state.transaction = None;
            state.mdl.release_transactional_locks();
        }

        if ordered {
            self.server.commit_order().leave(meta.seqno());
            self.server.advance_checkpoint(meta.gtid);
        }
        result
    }

    pub(crate) fn log_dummy_write_set(&mut self, _handle: WsHandle, meta: &WsMeta) -> Result<()> {
        debug!(target: "replicore::applier", seqno = meta.seqno().get(), "log dummy write set");
        if meta.is_ordered() {
            self.server.commit_order().enter(meta.seqno(), || false);
            self.server.commit_order().leave(meta.seqno());
            self.server.advance_checkpoint(meta.gtid);
        }
        Ok(())
    }

    /// Drop a finished transaction from the session
    pub(crate) fn after_apply(&mut self) {
        let mut state = self.session().lock();
        if state
            .transaction
            .as_ref()
            .map_or(false, |t| t.state().is_terminal())
        {
            state.transaction = None;
        }
        state.proc_info = "applier idle";
    }

    pub(crate) fn store_globals(&self) {
        self.session().store_globals();
    }

    pub(crate) fn reset_globals(&self) {
        self.session().restore_globals();
    }

    /// Identity and applied fragments of the current transaction
    pub(crate) fn streaming_identity(&self) -> Result<(bool, ServerId, TransactionId, Vec<replicore_core::Seqno>)> {
        let state = self.session().lock();
        let trx = state.transaction()?;
        Ok((
            trx.is_streaming(),
            trx.server_id(),
            trx.id(),
            trx.fragments().to_vec(),
        ))
    }
}
