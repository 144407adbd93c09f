//! replicore - certification-based replication for multi-master nodes
//!
//! replicore turns totally ordered, certified write-sets into local
//! transactions and drives local transactions through certification and
//! ordered commit. Conflicts between replicated and local work are resolved
//! by forced aborts that run in the background.
//!
//! # Quick Start
//!
//! ```ignore
//! use replicore::{LoopbackProvider, Node, ReplicationConfig, Value};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(LoopbackProvider::new());
//! let node = Node::in_memory(ReplicationConfig::default(), provider)?;
//! node.server().engine().create_table("t", false)?;
//!
//! let mut client = node.client();
//! client.begin()?;
//! client.insert("t", vec![Value::Int(1), Value::Text("a".into())])?;
//! client.commit()?;
//! node.shutdown()?;
//! ```
//!
//! # Architecture
//!
//! - `replicore-core`: ids, write-set metadata, events and their codec,
//!   diagnostics, the error taxonomy
//! - `replicore-storage`: in-memory transactional engine, streaming log,
//!   checkpoints, page cache pin protocol
//! - `replicore-concurrency`: transaction state machine, sessions, commit
//!   order, abort queues
//! - `replicore-engine`: apply loop, services, server context, abort
//!   coordinator, client sessions, loopback provider

pub use replicore_engine::*;

pub use replicore_core::{
    decode_next, encode_event, ApplyErrorBuffer, Diagnostics, DiagnosticsStatus, Event,
    EventBody, EventType, EventWriter, FormatDescription, Gtid, ProviderStatus, ReplicationError,
    Result, Row, Seqno, ServerId, TransactionId, Value, WriteSet, WsFlags, WsHandle, WsMeta,
};
pub use replicore_concurrency::{
    CommitOrder, OrderEntry, Session, SessionMode, SessionQueue, Transaction, TransactionState,
};
pub use replicore_storage::{
    BlockNum, CacheTable, FileId, Fragment, MemoryEngine, PinMode, PinOutcome, PinnedPair,
    StorageError, StreamingLog, TrxOptions, Unlocker,
};
