//! Applier service: applies write-sets delivered by the provider
//!
//! One `ApplierService` exists per applier thread and one per open
//! streaming transaction. Each owns a session held in high-priority mode
//! for the service's lifetime.

use crate::provider::ApplierUpcall;
use crate::server::ServerContext;
use crate::service::{HighPriorityService, ServiceCore};
use replicore_concurrency::{Session, Transaction, TransactionState};
use replicore_core::{ApplyErrorBuffer, Result, WriteSet, WsHandle, WsMeta};
use std::sync::Arc;
use tracing::debug;

/// High-priority service of an applier thread or streaming applier
#[derive(Debug)]
pub struct ApplierService {
    core: ServiceCore,
}

impl ApplierService {
    /// Put `session` into applier mode
    pub fn new(server: Arc<ServerContext>, session: Arc<Session>) -> Self {
        Self {
            core: ServiceCore::new(server, session),
        }
    }

    /// The applier's session
    pub fn session(&self) -> &Arc<Session> {
        self.core.session()
    }

    /// Summary of the last apply failure
    pub fn apply_error(&self) -> &ApplyErrorBuffer {
        &self.core.error
    }

    /// Leave applier mode and hand back the session
    pub(crate) fn into_session(self) -> Arc<Session> {
        let session = Arc::clone(self.core.session());
        drop(self);
        session
    }
}

impl HighPriorityService for ApplierService {
    fn start_transaction(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        self.core.start_transaction(handle, meta)
    }

    fn adopt_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        self.core.adopt_transaction(transaction)
    }

    fn apply_write_set(&mut self, meta: &WsMeta, data: &[u8]) -> Result<()> {
        self.core.require_state(TransactionState::Executing)?;
        self.core.set_proc_info("applying write set");
        let applied = self.core.run_apply_loop(meta, data)?;
        self.core.mark_fragment(meta)?;
        self.core.set_proc_info("applied write set");
        debug!(
            target: "replicore::applier",
            seqno = meta.seqno().get(),
            executed = applied.executed,
            skipped = applied.skipped,
            "applied write set"
        );
        Ok(())
    }

    fn append_fragment_and_commit(&mut self, handle: WsHandle, meta: &WsMeta, data: &[u8]) -> Result<()> {
        self.core.append_fragment_and_commit(handle, meta, data)
    }

    fn remove_fragments(&mut self, meta: &WsMeta) -> Result<()> {
        self.core.remove_fragments(meta)
    }

    fn commit(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        self.core.commit(handle, meta)
    }

    fn rollback(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        self.core.rollback(handle, meta)
    }

    fn apply_toi(&mut self, meta: &WsMeta, data: &[u8]) -> Result<()> {
        self.core.apply_toi(meta, data)
    }

    fn log_dummy_write_set(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        self.core.log_dummy_write_set(handle, meta)
    }

    fn after_apply(&mut self) {
        self.core.after_apply();
    }

    fn store_globals(&mut self) {
        self.core.store_globals();
    }

    fn reset_globals(&mut self) {
        self.core.reset_globals();
    }

    fn must_exit(&self) -> bool {
        self.core.ctx.must_exit()
    }

    fn is_replaying(&self) -> bool {
        false
    }
}

impl ApplierUpcall for ApplierService {
    fn on_apply(&mut self, ws: &WriteSet) -> Result<()> {
        let server = Arc::clone(&self.core.server);
        let result = server.on_apply(self, ws);
        // exit requests are only consumed by applier threads
        let must_exit = server.check_exit_status();
        self.core.ctx.set_must_exit(must_exit);
        result
    }

    fn must_exit(&self) -> bool {
        self.core.ctx.must_exit()
    }
}
