//! Streaming log: the fragment side-table
//!
//! Applied fragments of streaming transactions are persisted in a reserved
//! engine table so that a node restarting mid-transaction can rebuild the
//! transaction from its fragments. Rows are written and deleted inside
//! ordinary storage transactions.
//!
//! Row layout: `[key, server_id, transaction_id, seqno, flags, payload]`
//! with key `"{server_id}:{transaction_id:020}:{seqno:020}"`, so a prefix
//! scan on `"{server_id}:{transaction_id:020}:"` yields one transaction's
//! fragments in seqno order.

use crate::engine::MemoryEngine;
use crate::error::{StorageError, StorageResult};
use crate::locks::StorageTrx;
use replicore_core::{Seqno, ServerId, TransactionId, Value, WsFlags};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Name of the reserved table
pub const STREAMING_LOG_TABLE: &str = "replicore_streaming_log";

/// One stored fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Originating node
    pub server_id: ServerId,
    /// Originator-local transaction id
    pub transaction_id: TransactionId,
    /// Seqno the fragment was ordered at
    pub seqno: Seqno,
    /// Flags the fragment was delivered with
    pub flags: WsFlags,
    /// Serialized events
    pub payload: Vec<u8>,
}

/// Fragments grouped by transaction
pub type RecoveredFragments = BTreeMap<(ServerId, TransactionId), Vec<Fragment>>;

/// Access to the fragment side-table
#[derive(Debug, Clone)]
pub struct StreamingLog {
    engine: Arc<MemoryEngine>,
}

fn trx_prefix(server_id: ServerId, transaction_id: TransactionId) -> String {
    format!("{}:{:020}:", server_id, transaction_id.get())
}

fn row_key(server_id: ServerId, transaction_id: TransactionId, seqno: Seqno) -> Value {
    Value::Text(format!(
        "{}{:020}",
        trx_prefix(server_id, transaction_id),
        seqno.get().max(0)
    ))
}

impl StreamingLog {
    /// Open the streaming log, creating its table if needed
    pub fn open(engine: Arc<MemoryEngine>) -> StorageResult<Self> {
        engine.create_table(STREAMING_LOG_TABLE, true)?;
        Ok(Self { engine })
    }

    /// Store a fragment inside `trx`
    pub fn append(&self, trx: StorageTrx, fragment: &Fragment) -> StorageResult<()> {
        let row = vec![
            row_key(fragment.server_id, fragment.transaction_id, fragment.seqno),
            Value::Text(fragment.server_id.to_string()),
            Value::Int(fragment.transaction_id.get() as i64),
            Value::Int(fragment.seqno.get()),
            Value::Int(fragment.flags.bits() as i64),
            Value::Bytes(fragment.payload.clone()),
        ];
        self.engine.insert(trx, STREAMING_LOG_TABLE, row)?;
        debug!(
            target: "replicore::streaming",
            trx,
            seqno = fragment.seqno.get(),
            transaction = %fragment.transaction_id,
            "fragment stored"
        );
        Ok(())
    }

    /// Delete the given fragments of a transaction inside `trx`
    ///
    /// Seqnos with no stored fragment are skipped.
    pub fn remove(
        &self,
        trx: StorageTrx,
        server_id: ServerId,
        transaction_id: TransactionId,
        seqnos: &[Seqno],
    ) -> StorageResult<usize> {
        let mut removed = 0;
        for seqno in seqnos {
            let key = row_key(server_id, transaction_id, *seqno);
            if self.engine.get(Some(trx), STREAMING_LOG_TABLE, &key)?.is_some() {
                self.engine.delete(trx, STREAMING_LOG_TABLE, &vec![key])?;
                removed += 1;
            }
        }
        debug!(target: "replicore::streaming", trx, removed, transaction = %transaction_id, "fragments removed");
        Ok(removed)
    }

    /// Committed fragments of one transaction in seqno order
    pub fn fragments(
        &self,
        server_id: ServerId,
        transaction_id: TransactionId,
    ) -> StorageResult<Vec<Fragment>> {
        self.engine
            .scan_prefix(STREAMING_LOG_TABLE, &trx_prefix(server_id, transaction_id))?
            .iter()
            .map(|row| decode_row(row))
            .collect()
    }

    /// Every committed fragment grouped by transaction
    pub fn recover(&self) -> StorageResult<RecoveredFragments> {
        let mut recovered = RecoveredFragments::new();
        for row in self.engine.scan(STREAMING_LOG_TABLE)? {
            let fragment = decode_row(&row)?;
            recovered
                .entry((fragment.server_id, fragment.transaction_id))
                .or_default()
                .push(fragment);
        }
        for fragments in recovered.values_mut() {
            fragments.sort_by_key(|f| f.seqno);
        }
        Ok(recovered)
    }

    /// The engine the log lives in
    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }
}

fn decode_row(row: &[Value]) -> StorageResult<Fragment> {
    let corrupt = || StorageError::Corruption("malformed streaming log row".to_string());
    match row {
        [_, Value::Text(server), Value::Int(trx), Value::Int(seqno), Value::Int(flags), Value::Bytes(payload)] => {
            Ok(Fragment {
                server_id: ServerId::from_string(server).ok_or_else(corrupt)?,
                transaction_id: TransactionId::new(*trx as u64),
                seqno: Seqno::new(*seqno),
                flags: WsFlags::from_bits_truncate(*flags as u32),
                payload: payload.clone(),
            })
        }
        _ => Err(corrupt()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrxOptions;
    use std::time::Duration;

    fn fragment(server: ServerId, trx: u64, seqno: i64) -> Fragment {
        Fragment {
            server_id: server,
            transaction_id: TransactionId::new(trx),
            seqno: Seqno::new(seqno),
            flags: WsFlags::START_TRANSACTION,
            payload: vec![seqno as u8],
        }
    }

    fn log() -> StreamingLog {
        StreamingLog::open(Arc::new(MemoryEngine::new(Duration::from_millis(50)))).unwrap()
    }

    #[test]
    fn test_fragments_in_seqno_order() {
        let log = log();
        let server = ServerId::new();
        let trx = log.engine().begin(TrxOptions::default());
        for seqno in [12, 3, 7] {
            log.append(trx, &fragment(server, 1, seqno)).unwrap();
        }
        log.append(trx, &fragment(server, 2, 5)).unwrap();
        log.engine().commit(trx, false).unwrap();

        let seqnos: Vec<i64> = log
            .fragments(server, TransactionId::new(1))
            .unwrap()
            .iter()
            .map(|f| f.seqno.get())
            .collect();
        assert_eq!(seqnos, vec![3, 7, 12]);
    }

    #[test]
    fn test_uncommitted_fragments_invisible() {
        let log = log();
        let server = ServerId::new();
        let trx = log.engine().begin(TrxOptions::default());
        log.append(trx, &fragment(server, 1, 1)).unwrap();
        assert!(log.fragments(server, TransactionId::new(1)).unwrap().is_empty());
        log.engine().rollback(trx);
        assert!(log.recover().unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let log = log();
        let server = ServerId::new();
        let trx = log.engine().begin(TrxOptions::default());
        log.append(trx, &fragment(server, 1, 1)).unwrap();
        log.append(trx, &fragment(server, 1, 2)).unwrap();
        log.engine().commit(trx, false).unwrap();

        let trx = log.engine().begin(TrxOptions::default());
        let removed = log
            .remove(trx, server, TransactionId::new(1), &[Seqno::new(1), Seqno::new(2), Seqno::new(9)])
            .unwrap();
        assert_eq!(removed, 2);
        log.engine().commit(trx, false).unwrap();
        assert!(log.fragments(server, TransactionId::new(1)).unwrap().is_empty());
    }

    #[test]
    fn test_recover_groups_by_transaction() {
        let log = log();
        let a = ServerId::new();
        let b = ServerId::new();
        let trx = log.engine().begin(TrxOptions::default());
        log.append(trx, &fragment(a, 1, 4)).unwrap();
        log.append(trx, &fragment(b, 1, 2)).unwrap();
        log.append(trx, &fragment(a, 1, 1)).unwrap();
        log.engine().commit(trx, false).unwrap();

        let recovered = log.recover().unwrap();
        assert_eq!(recovered.len(), 2);
        let a_seqnos: Vec<i64> = recovered[&(a, TransactionId::new(1))]
            .iter()
            .map(|f| f.seqno.get())
            .collect();
        assert_eq!(a_seqnos, vec![1, 4]);
    }
}
