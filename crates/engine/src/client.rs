//! Client sessions: local transactions replicated through the provider
//!
//! A [`ClientSession`] runs row statements against the engine, records them
//! as events and hands the resulting write-set to the provider for
//! certification at commit. A client transaction can be chosen as the
//! victim of a forced abort at any point:
//! - idle between statements: the rollbacker rolls it back and the next
//!   statement reports a deadlock
//! - inside a statement: its lock wait is broken and it rolls itself back
//!   when the statement ends
//! - waiting to commit after certification: it is replayed

use crate::provider::{CertificationRequest, Provider};
use crate::replayer::ReplayerService;
use crate::server::ServerContext;
use crate::service::{finish_rollback, HighPriorityService};
use replicore_concurrency::{
    MdlDuration, OptionBits, OrderEntry, ServerStatus, Session, SessionMode, Transaction,
    TransactionState,
};
use replicore_core::{
    EventWriter, FormatDescription, ProviderStatus, ReplicationError, Result, Row, WsFlags,
    WsHandle, WsMeta,
};
use replicore_storage::{StorageError, StorageResult, StorageTrx, TrxOptions, ER_LOCK_DEADLOCK};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ROLLBACK_POLL: Duration = Duration::from_millis(50);

const DEADLOCK_MESSAGE: &str = "Deadlock found when trying to get lock; try restarting transaction";

/// A local client connection
pub struct ClientSession {
    server: Arc<ServerContext>,
    provider: Arc<dyn Provider>,
    session: Arc<Session>,
    events: Option<EventWriter>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("session", &self.session.id())
            .field("state", &self.session.transaction_state())
            .finish()
    }
}

impl ClientSession {
    /// Open a connection on a pooled session
    pub fn connect(server: &Arc<ServerContext>, provider: Arc<dyn Provider>) -> Self {
        let session = server.acquire_session();
        {
            let mut state = session.lock();
            state.mode = SessionMode::Local;
            state.attrs.option_bits.insert(OptionBits::BIN_LOG);
            state.attrs.server_status.set(ServerStatus::AUTOCOMMIT, true);
            state.proc_info = "client idle";
        }
        debug!(target: "replicore::client", session = session.id(), "client connected");
        Self {
            server: Arc::clone(server),
            provider,
            session,
            events: None,
        }
    }

    /// The client's session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Open a transaction
    ///
    /// # Errors
    ///
    /// `InvalidState` if a transaction is already open.
    pub fn begin(&mut self) -> Result<()> {
        self.reap_aborted();
        if let Some(state) = self.session.transaction_state() {
            if !state.is_terminal() {
                return Err(ReplicationError::InvalidState(format!(
                    "transaction already open in state {}",
                    state
                )));
            }
        }

        let storage = self.server.engine().begin(TrxOptions::default());
        self.server.register_trx(storage, &self.session);
        let id = self.server.next_transaction_id();
        let mut trx = Transaction::new(id, self.server.node_id());
        trx.set_ws(WsHandle::new(id, 0), WsMeta::default());
        trx.set_storage_trx(Some(storage));
        {
            let mut state = self.session.lock();
            state.transaction = Some(trx);
            state.attrs.option_bits.insert(OptionBits::BEGIN);
            state.attrs.server_status.set(ServerStatus::IN_TRANS, true);
            state.diagnostics.reset();
        }

        let mut writer = EventWriter::new(self.server.numeric_id());
        writer.format_description(FormatDescription::v4());
        self.events = Some(writer);
        debug!(target: "replicore::client", session = self.session.id(), trx = %id, "transaction started");
        Ok(())
    }

    /// Insert a row
    pub fn insert(&mut self, table: &str, row: Row) -> Result<()> {
        let storage = self.before_statement()?;
        let result = self.server.engine().insert(storage, table, row.clone());
        self.after_statement(table, result)?;
        if let Some(writer) = self.events.as_mut() {
            writer.write_rows(table, vec![row]);
        }
        Ok(())
    }

    /// Replace `before` with `after`
    pub fn update(&mut self, table: &str, before: Row, after: Row) -> Result<()> {
        let storage = self.before_statement()?;
        let result = self.server.engine().update(storage, table, &before, after.clone());
        self.after_statement(table, result)?;
        if let Some(writer) = self.events.as_mut() {
            writer.update_rows(table, vec![(before, after)]);
        }
        Ok(())
    }

    /// Delete a row
    pub fn delete(&mut self, table: &str, row: Row) -> Result<()> {
        let storage = self.before_statement()?;
        let result = self.server.engine().delete(storage, table, &row);
        self.after_statement(table, result)?;
        if let Some(writer) = self.events.as_mut() {
            writer.delete_rows(table, vec![row]);
        }
        Ok(())
    }

    /// Certify and commit the open transaction
    ///
    /// # Errors
    ///
    /// `CertificationConflict` if certification failed, a deadlock storage
    /// error if the transaction was aborted, `Provider` if the provider
    /// could not certify.
    pub fn commit(&mut self) -> Result<()> {
        let storage = self.before_statement()?;
        let result = self.commit_inner(storage);
        self.session.lock().in_command = false;
        result
    }

    /// Roll back the open transaction
    pub fn rollback(&mut self) -> Result<()> {
        let Some(state) = self.session.transaction_state() else {
            return Ok(());
        };
        match state {
            TransactionState::Aborting => {
                self.wait_for_background_rollback();
            }
            s if s.is_terminal() => {}
            _ => self.rollback_locally()?,
        }
        self.clear_transaction();
        debug!(target: "replicore::client", session = self.session.id(), "transaction rolled back");
        Ok(())
    }

    /// Roll back anything open and return the session to the pool
    pub fn close(mut self) {
        if let Err(e) = self.rollback() {
            warn!(target: "replicore::client", session = self.session.id(), error = %e, "rollback on close failed");
        }
        self.server.release_session(Arc::clone(&self.session));
    }

    // ========================================================================
    // Statement hooks
    // ========================================================================

    fn before_statement(&mut self) -> Result<StorageTrx> {
        let verdict = {
            let mut state = self.session.lock();
            let (trx_state, storage) = match state.transaction.as_ref() {
                Some(trx) => (trx.state(), trx.storage_trx()),
                None => {
                    return Err(ReplicationError::InvalidState("no transaction open".into()));
                }
            };
            match (trx_state, storage) {
                (TransactionState::Executing, Some(storage)) => {
                    state.in_command = true;
                    Some(storage)
                }
                (TransactionState::MustAbort, _)
                | (TransactionState::Aborting, _)
                | (TransactionState::Aborted, _) => None,
                (other, _) => {
                    return Err(ReplicationError::InvalidState(format!(
                        "statement not allowed in state {}",
                        other
                    )));
                }
            }
        };
        verdict.ok_or_else(|| self.bf_aborted())
    }

    fn after_statement<T>(&mut self, table: &str, result: StorageResult<T>) -> Result<T> {
        let aborted = {
            let mut state = self.session.lock();
            state.in_command = false;
            if result.is_ok() {
                state.mdl.acquire(table, MdlDuration::Transaction);
            }
            state.transaction.as_ref().map(|t| t.state()) == Some(TransactionState::MustAbort)
        };
        if aborted {
            return Err(self.bf_aborted());
        }
        result.map_err(|e| {
            self.session.lock().diagnostics.set_error(e.code(), e.to_string());
            e.into()
        })
    }

    /// Finish a transaction that lost a forced abort; returns the error the
    /// client sees
    fn bf_aborted(&mut self) -> ReplicationError {
        match self.session.transaction_state() {
            Some(TransactionState::MustAbort) => {
                if let Err(e) = self.rollback_locally() {
                    warn!(target: "replicore::client", session = self.session.id(), error = %e, "local rollback failed");
                }
            }
            Some(TransactionState::Aborting) => {
                self.wait_for_background_rollback();
            }
            _ => {}
        }
        info!(target: "replicore::client", session = self.session.id(), "transaction aborted by conflict");
        self.session
            .lock()
            .diagnostics
            .set_error(ER_LOCK_DEADLOCK, DEADLOCK_MESSAGE);
        self.clear_transaction();
        StorageError::Deadlock.into()
    }

    /// Clean up a transaction aborted while the client was away
    fn reap_aborted(&mut self) {
        if matches!(
            self.session.transaction_state(),
            Some(TransactionState::MustAbort | TransactionState::Aborting | TransactionState::Aborted)
        ) {
            let _ = self.bf_aborted();
        }
    }

    /// Wait until the rollbacker released the storage transaction
    fn wait_for_background_rollback(&self) -> bool {
        let deadline = Instant::now() + self.server.config().lock_wait_timeout() * 2;
        loop {
            let pending = {
                let state = self.session.lock();
                matches!(
                    state.transaction.as_ref(),
                    Some(t) if t.state() == TransactionState::Aborting && t.storage_trx().is_some()
                )
            };
            if !pending {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(target: "replicore::client", session = self.session.id(), "background rollback did not finish");
                return false;
            }
            self.session.wait_rollback_complete(ROLLBACK_POLL);
        }
    }

    fn rollback_locally(&mut self) -> Result<()> {
        let storage = {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            finish_rollback(trx)?;
            let storage = trx.take_storage_trx();
            state.mdl.release_transactional_locks();
            storage
        };
        if let Some(storage) = storage {
            self.server.engine().rollback(storage);
            self.server.unregister_trx(storage);
        }
        Ok(())
    }

    fn clear_transaction(&mut self) {
        self.events = None;
        let mut state = self.session.lock();
        state.transaction = None;
        state.in_command = false;
        state.mdl.release_transactional_locks();
        state.attrs.option_bits.remove(OptionBits::BEGIN);
        state.attrs.server_status.set(ServerStatus::IN_TRANS, false);
        state.proc_info = "client idle";
    }

    // ========================================================================
    // Commit
    // ========================================================================

    fn commit_inner(&mut self, storage: StorageTrx) -> Result<()> {
        if self.server.engine().pending_changes(storage) == 0 {
            return self.commit_read_only(storage);
        }

        let (id, handle, aborted) = {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            let aborted = trx.state() == TransactionState::MustAbort;
            if !aborted {
                trx.transition(TransactionState::Certifying)?;
            }
            (trx.id(), trx.handle(), aborted)
        };
        if aborted {
            return Err(self.bf_aborted());
        }

        let data = self.events.take().map(|w| w.finish()).unwrap_or_default();
        let certification = self.provider.certify(CertificationRequest {
            handle,
            server_id: self.server.node_id(),
            transaction_id: id,
            flags: WsFlags::START_TRANSACTION | WsFlags::COMMIT,
            data,
        });
        match certification.status {
            ProviderStatus::Success => self.commit_certified(handle, certification.meta, storage),
            ProviderStatus::CertificationFailed => self.certification_failed(handle, certification.meta),
            other => {
                warn!(target: "replicore::client", trx = %id, status = %other, "certification failed");
                self.rollback_locally()?;
                self.clear_transaction();
                Err(ReplicationError::Provider(format!(
                    "could not certify transaction {}: {}",
                    id, other
                )))
            }
        }
    }

    fn commit_read_only(&mut self, storage: StorageTrx) -> Result<()> {
        {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            if trx.state() == TransactionState::MustAbort {
                drop(state);
                return Err(self.bf_aborted());
            }
            trx.transition(TransactionState::Committing)?;
            trx.transition(TransactionState::Committed)?;
        }
        self.server.engine().commit(storage, false)?;
        self.server.unregister_trx(storage);
        self.session.lock().diagnostics.set_ok(0, 0, "");
        self.clear_transaction();
        Ok(())
    }

    fn commit_certified(&mut self, handle: WsHandle, meta: WsMeta, storage: StorageTrx) -> Result<()> {
        let replay = {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            trx.set_ws(handle, meta);
            match trx.state() {
                TransactionState::Certifying => {
                    trx.transition(TransactionState::Committing)?;
                    false
                }
                TransactionState::MustAbort => {
                    trx.transition(TransactionState::MustReplay)?;
                    true
                }
                other => {
                    return Err(ReplicationError::InvalidState(format!(
                        "certified transaction in state {}",
                        other
                    )));
                }
            }
        };
        if replay {
            return self.replay();
        }

        let session = Arc::clone(&self.session);
        let entry = self.server.commit_order().enter(meta.seqno(), || {
            session.transaction_state() == Some(TransactionState::MustReplay)
        });
        let replay = {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            if entry == OrderEntry::Interrupted || trx.state() == TransactionState::MustReplay {
                true
            } else {
                trx.transition(TransactionState::OrderedCommit)?;
                false
            }
        };
        if replay {
            return self.replay();
        }

        let logged = self
            .session
            .lock()
            .attrs
            .option_bits
            .contains(OptionBits::BIN_LOG);
        let committed = self.server.engine().commit(storage, logged);
        self.server.unregister_trx(storage);
        let changes = match committed {
            Ok(changes) => changes,
            Err(e) => {
                self.server.commit_order().leave(meta.seqno());
                return Err(ReplicationError::InternalInconsistency(format!(
                    "certified transaction failed to commit: {}",
                    e
                )));
            }
        };
        {
            let mut state = self.session.lock();
            state.transaction_mut()?.transition(TransactionState::Committed)?;
            state.diagnostics.set_ok(changes as u64, 0, "");
        }
        self.server.commit_order().leave(meta.seqno());
        self.server.advance_checkpoint(meta.gtid);
        debug!(
            target: "replicore::client",
            session = self.session.id(),
            seqno = meta.seqno().get(),
            changes,
            "transaction committed"
        );
        self.clear_transaction();
        Ok(())
    }

    fn certification_failed(&mut self, handle: WsHandle, meta: WsMeta) -> Result<()> {
        let (id, storage) = {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            trx.set_ws(handle, meta);
            if trx.state() == TransactionState::Certifying {
                trx.transition(TransactionState::CertFailed)?;
            }
            finish_rollback(trx)?;
            let id = trx.id();
            let storage = trx.take_storage_trx();
            state.diagnostics.set_error(ER_LOCK_DEADLOCK, DEADLOCK_MESSAGE);
            (id, storage)
        };
        if let Some(storage) = storage {
            self.server.engine().rollback(storage);
            self.server.unregister_trx(storage);
        }
        if meta.is_ordered() {
            self.server.commit_order().skip(meta.seqno());
            self.server.advance_checkpoint(meta.gtid);
        }
        info!(target: "replicore::client", trx = %id, seqno = meta.seqno().get(), "certification conflict");
        self.clear_transaction();
        Err(ReplicationError::CertificationConflict(id))
    }

    /// Re-apply the certified write-set after losing a conflict
    fn replay(&mut self) -> Result<()> {
        let (storage, handle, meta, snapshot) = {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            let storage = trx.take_storage_trx();
            trx.transition(TransactionState::Replaying)?;
            (storage, trx.handle(), *trx.meta(), trx.clone())
        };
        if let Some(storage) = storage {
            self.server.engine().rollback(storage);
            self.server.unregister_trx(storage);
        }
        info!(
            target: "replicore::client",
            session = self.session.id(),
            trx = %snapshot.id(),
            seqno = meta.seqno().get(),
            "replaying transaction"
        );

        let mut replayer = ReplayerService::new(Arc::clone(&self.server), Arc::clone(&self.session));
        replayer.store_globals();
        let started = replayer
            .start_transaction(handle, &meta)
            .and_then(|_| replayer.adopt_transaction(&snapshot));
        let status = match started {
            Ok(()) => self.provider.replay(handle, &mut replayer),
            Err(e) => {
                warn!(target: "replicore::client", error = %e, "could not start replay");
                ProviderStatus::Fatal
            }
        };
        if !status.is_success()
            && !self
                .session
                .transaction_state()
                .map_or(true, |s| s.is_terminal())
        {
            if let Err(e) = replayer.rollback(handle, &meta) {
                warn!(target: "replicore::client", error = %e, "rollback after failed replay failed");
            }
        }
        replayer.reset_globals();
        let result = replayer.finish(status);
        self.clear_transaction();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::loopback::LoopbackProvider;
    use replicore_core::{DiagnosticsStatus, Seqno, Value};

    fn setup() -> (Arc<ServerContext>, Arc<LoopbackProvider>) {
        let server = ServerContext::in_memory(ReplicationConfig::default()).unwrap();
        server.engine().create_table("t", false).unwrap();
        (server, Arc::new(LoopbackProvider::new()))
    }

    fn row(id: i64, v: &str) -> Row {
        vec![Value::Int(id), Value::Text(v.to_string())]
    }

    #[test]
    fn test_commit_certifies_and_orders() {
        let (server, provider) = setup();
        let mut client = ClientSession::connect(&server, provider.clone());
        client.begin().unwrap();
        client.insert("t", row(1, "a")).unwrap();
        client.commit().unwrap();

        assert_eq!(server.engine().scan("t").unwrap(), vec![row(1, "a")]);
        assert_eq!(server.commit_order().position(), Seqno::new(1));
        assert_eq!(provider.certified().len(), 1);
        assert!(client.session().lock().transaction.is_none());
        assert!(matches!(
            client.session().lock().diagnostics.status(),
            DiagnosticsStatus::Ok { affected_rows: 1, .. }
        ));
    }

    #[test]
    fn test_read_only_commit_skips_certification() {
        let (server, provider) = setup();
        let mut client = ClientSession::connect(&server, provider.clone());
        client.begin().unwrap();
        client.commit().unwrap();
        assert!(provider.certified().is_empty());
        assert_eq!(server.commit_order().position(), Seqno::new(0));
    }

    #[test]
    fn test_certification_conflict_rolls_back_and_skips() {
        let (server, provider) = setup();
        provider.script_certification(ProviderStatus::CertificationFailed);
        let mut client = ClientSession::connect(&server, provider.clone());
        client.begin().unwrap();
        client.insert("t", row(1, "a")).unwrap();
        let err = client.commit().unwrap_err();
        assert!(matches!(err, ReplicationError::CertificationConflict(_)));
        assert!(server.engine().scan("t").unwrap().is_empty());
        // the failed position is released for later transactions
        assert_eq!(server.commit_order().position(), Seqno::new(1));

        client.begin().unwrap();
        client.insert("t", row(2, "b")).unwrap();
        client.commit().unwrap();
        assert_eq!(server.commit_order().position(), Seqno::new(2));
    }

    #[test]
    fn test_statement_error_keeps_transaction_open() {
        let (server, provider) = setup();
        let mut client = ClientSession::connect(&server, provider);
        client.begin().unwrap();
        client.insert("t", row(1, "a")).unwrap();
        assert!(client.insert("t", row(1, "b")).is_err());
        assert_eq!(client.session().transaction_state(), Some(TransactionState::Executing));
        client.rollback().unwrap();
        assert!(server.engine().scan("t").unwrap().is_empty());
    }

    #[test]
    fn test_statement_without_begin_rejected() {
        let (server, provider) = setup();
        let mut client = ClientSession::connect(&server, provider);
        assert!(matches!(
            client.insert("t", row(1, "a")),
            Err(ReplicationError::InvalidState(_))
        ));
    }

    #[test]
    fn test_must_abort_between_statements_reports_deadlock() {
        let (server, provider) = setup();
        let mut client = ClientSession::connect(&server, provider);
        client.begin().unwrap();
        client.insert("t", row(1, "a")).unwrap();
        client
            .session()
            .lock()
            .transaction_mut()
            .unwrap()
            .transition(TransactionState::MustAbort)
            .unwrap();

        let err = client.insert("t", row(2, "b")).unwrap_err();
        assert_eq!(err.code(), Some(ER_LOCK_DEADLOCK));
        assert!(client.session().lock().transaction.is_none());
        assert!(server.engine().scan("t").unwrap().is_empty());
    }

    #[test]
    fn test_close_returns_session_to_pool() {
        let (server, provider) = setup();
        let mut client = ClientSession::connect(&server, provider);
        client.begin().unwrap();
        client.insert("t", row(1, "a")).unwrap();
        client.close();
        assert_eq!(server.pooled_sessions(), 1);
        assert!(server.engine().scan("t").unwrap().is_empty());
    }
}
