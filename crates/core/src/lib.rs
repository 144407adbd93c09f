//! Core types for replicore
//!
//! This crate defines the foundational types used throughout the system:
//! - ServerId, TransactionId, Seqno, Gtid: identity and ordering of write-sets
//! - WsFlags, WsHandle, WsMeta, WriteSet: what the provider delivers
//! - ProviderStatus: result codes of the replication provider
//! - ReplicationError: error hierarchy
//! - Event model and wire codec for write-set payloads
//! - Diagnostics area and the bounded apply error buffer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod types;

pub use codec::{decode_next, encode_event, EventWriter};
pub use diagnostics::{
    ApplyErrorBuffer, Condition, Diagnostics, DiagnosticsStatus, DEFAULT_APPLY_ERROR_BUFFER,
};
pub use error::{ReplicationError, Result};
pub use event::{
    ChecksumAlg, Event, EventBody, EventHeader, EventType, FormatDescription, Row, SchemaChange,
    Value,
};
pub use types::{
    Gtid, ProviderStatus, Seqno, ServerId, TransactionId, WriteSet, WsFlags, WsHandle, WsMeta,
};
