//! Storage service: ordinary storage work on behalf of another transaction
//!
//! The rollbacker uses it to delete a victim's fragments from the
//! streaming log in a separate transaction before the victim itself is
//! rolled back. The service runs on a pooled session that goes back to the
//! pool through [`ServerContext::release_storage_service`].

use crate::server::ServerContext;
use crate::service::finish_rollback;
use replicore_concurrency::{OptionBits, Session, Transaction, TransactionState};
use replicore_core::{ReplicationError, Result, WsHandle, WsMeta};
use replicore_storage::{StorageTrx, TrxOptions};
use std::sync::Arc;
use tracing::debug;

/// Storage access on a pooled session
#[derive(Debug)]
pub struct StorageService {
    server: Arc<ServerContext>,
    session: Arc<Session>,
}

impl StorageService {
    pub(crate) fn new(server: Arc<ServerContext>, session: Arc<Session>) -> Self {
        session.lock().proc_info = "storage service";
        Self { server, session }
    }

    /// The pooled session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn into_session(self) -> Arc<Session> {
        self.session
    }

    /// Make the calling thread the owner of the session
    pub fn store_globals(&self) {
        self.session.store_globals();
    }

    /// Give up session ownership
    pub fn reset_globals(&self) {
        self.session.restore_globals();
    }

    /// Take over the identity and fragments of `transaction`
    pub fn adopt_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        let storage = self.server.engine().begin(TrxOptions::default());
        self.server.register_trx(storage, &self.session);

        let mut trx = Transaction::new(transaction.id(), transaction.server_id());
        trx.set_ws(transaction.handle(), *transaction.meta());
        for seqno in transaction.fragments() {
            trx.fragment_applied(*seqno);
        }
        trx.set_streaming(transaction.is_streaming());
        trx.set_storage_trx(Some(storage));

        let stale = self
            .session
            .lock()
            .transaction
            .replace(trx)
            .and_then(|mut old| old.take_storage_trx());
        if let Some(stale) = stale {
            self.rollback_storage(stale);
        }
        Ok(())
    }

    /// Delete the adopted transaction's fragments; returns rows removed
    pub fn remove_fragments(&mut self) -> Result<usize> {
        let (storage, server_id, transaction_id, fragments) = {
            let state = self.session.lock();
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
            target: "replicore::rollbacker",
            trx = %transaction_id,
            removed,
            "storage service removed fragments"
        );
        Ok(removed)
    }

    /// Commit the storage work
    ///
    /// With unordered `meta` the replication state is only cleaned up.
    pub fn commit(&mut self, handle: WsHandle, meta: &WsMeta) -> Result<()> {
        let ordered = meta.is_ordered();
        let storage = {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            trx.set_ws(handle, *meta);
            trx.transition(TransactionState::Committing)?;
            trx.take_storage_trx()
        };
        if ordered {
            self.server.commit_order().enter(meta.seqno(), || false);
        }
        if let Some(storage) = storage {
            let logged = self
                .session
                .lock()
                .attrs
                .option_bits
                .contains(OptionBits::BIN_LOG);
            let result = self.server.engine().commit(storage, logged);
            self.server.unregister_trx(storage);
            result?;
        }
        {
            let mut state = self.session.lock();
            let trx = state.transaction_mut()?;
            if ordered {
                trx.transition(TransactionState::Committed)?;
            } else {
                finish_rollback(trx)?;
            }
            state.mdl.release_transactional_locks();
        }
        if ordered {
            self.server.commit_order().leave(meta.seqno());
            self.server.advance_checkpoint(meta.gtid);
        }
        Ok(())
    }

    /// Roll back the storage work
    pub fn rollback(&mut self) -> Result<()> {
        let storage = {
            let mut state = self.session.lock();
            let storage = match state.transaction.as_mut() {
                Some(trx) => {
                    finish_rollback(trx)?;
                    trx.take_storage_trx()
                }
                None => None,
            };
            state.mdl.release_transactional_locks();
            storage
        };
        if let Some(storage) = storage {
            self.rollback_storage(storage);
        }
        Ok(())
    }

    fn rollback_storage(&self, trx: StorageTrx) {
        self.server.engine().rollback(trx);
        self.server.unregister_trx(trx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use replicore_core::{Seqno, ServerId, TransactionId, WsFlags};
    use replicore_storage::Fragment;

    fn fragment(server_id: ServerId, trx: u64, seqno: i64) -> Fragment {
        Fragment {
            server_id,
            transaction_id: TransactionId::new(trx),
            seqno: Seqno::new(seqno),
            flags: WsFlags::START_TRANSACTION,
            payload: vec![seqno as u8],
        }
    }

    #[test]
    fn test_remove_fragments_and_commit_unordered() {
        let server = ServerContext::in_memory(ReplicationConfig::default()).unwrap();
        let origin = ServerId::new();
        let log = server.streaming_log();
        let trx = server.engine().begin(TrxOptions::default());
        log.append(trx, &fragment(origin, 8, 1)).unwrap();
        log.append(trx, &fragment(origin, 8, 2)).unwrap();
        server.engine().commit(trx, false).unwrap();

        let mut victim = Transaction::new(TransactionId::new(8), origin);
        victim.fragment_applied(Seqno::new(1));
        victim.fragment_applied(Seqno::new(2));

        let mut service = server.storage_service();
        service.adopt_transaction(&victim).unwrap();
        assert_eq!(service.remove_fragments().unwrap(), 2);
        service
            .commit(WsHandle::new(victim.id(), 0), &WsMeta::default())
            .unwrap();
        assert_eq!(
            service.session().transaction_state(),
            Some(TransactionState::Aborted)
        );
        server.release_storage_service(service);

        assert!(log.fragments(origin, TransactionId::new(8)).unwrap().is_empty());
        assert_eq!(server.commit_order().position(), Seqno::new(0));
    }

    #[test]
    fn test_rollback_keeps_fragments() {
        let server = ServerContext::in_memory(ReplicationConfig::default()).unwrap();
        let origin = ServerId::new();
        let log = server.streaming_log();
        let trx = server.engine().begin(TrxOptions::default());
        log.append(trx, &fragment(origin, 9, 1)).unwrap();
        server.engine().commit(trx, false).unwrap();

        let mut victim = Transaction::new(TransactionId::new(9), origin);
        victim.fragment_applied(Seqno::new(1));

        let mut service = server.storage_service();
        service.adopt_transaction(&victim).unwrap();
        service.remove_fragments().unwrap();
        service.rollback().unwrap();
        server.release_storage_service(service);

        assert_eq!(log.fragments(origin, TransactionId::new(9)).unwrap().len(), 1);
    }
}
