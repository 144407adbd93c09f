//! Core types for replicore
//!
//! This module defines the identifiers and metadata that travel with every
//! replicated write-set:
//! - ServerId: UUID of the node that originated a transaction
//! - TransactionId: originator-local transaction identifier
//! - Seqno: position in the global total order (may be undefined)
//! - Gtid: cluster state id + seqno
//! - WsFlags: write-set flag bitset
//! - WsHandle / WsMeta: provider handle and metadata for one write-set

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use uuid::Uuid;

/// Identifier of a cluster node
///
/// A ServerId is a wrapper around a UUID. The nil UUID is reserved for
/// "undefined", which is what metadata carries for actions that did not
/// originate from a replicated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(Uuid);

impl ServerId {
    /// Create a new random ServerId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The undefined server id (nil UUID)
    pub const fn undefined() -> Self {
        Self(Uuid::nil())
    }

    /// Create a ServerId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a ServerId from a string representation
    ///
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this ServerId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// True for the nil id
    pub fn is_undefined(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::undefined()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Originator-local transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Sentinel for "no transaction"
    pub const UNDEFINED: TransactionId = TransactionId(u64::MAX);

    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    pub fn get(&self) -> u64 {
        self.0
    }

    /// True for the sentinel
    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undefined")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Position in the global total order
///
/// Seqnos start at 1. `Seqno::UNDEFINED` (-1) marks an action that was not
/// ordered by the provider; such actions skip every commit-order hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Seqno(i64);

impl Seqno {
    /// Unordered
    pub const UNDEFINED: Seqno = Seqno(-1);

    /// Wrap a raw seqno
    pub const fn new(seqno: i64) -> Self {
        Self(seqno)
    }

    /// Raw seqno
    pub fn get(&self) -> i64 {
        self.0
    }

    /// True when the action was not ordered
    pub fn is_undefined(&self) -> bool {
        self.0 < 0
    }

    /// The following position
    pub fn next(&self) -> Seqno {
        Seqno(self.0 + 1)
    }
}

impl Default for Seqno {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global transaction id: cluster state id + seqno
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gtid {
    /// Cluster state identifier
    pub id: ServerId,
    /// Position in the total order
    pub seqno: Seqno,
}

impl Gtid {
    /// Create a gtid
    pub fn new(id: ServerId, seqno: Seqno) -> Self {
        Self { id, seqno }
    }

    /// An undefined gtid
    pub fn undefined() -> Self {
        Self::default()
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.seqno)
    }
}

/// Write-set flag bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WsFlags(u32);

impl WsFlags {
    /// First fragment of a transaction
    pub const START_TRANSACTION: WsFlags = WsFlags(1 << 0);
    /// Last fragment, commit the transaction
    pub const COMMIT: WsFlags = WsFlags(1 << 1);
    /// Roll back the transaction
    pub const ROLLBACK: WsFlags = WsFlags(1 << 2);
    /// Total order isolation action
    pub const ISOLATION: WsFlags = WsFlags(1 << 3);
    /// Not safe for parallel applying
    pub const PA_UNSAFE: WsFlags = WsFlags(1 << 4);
    /// Changes must not be replicated further
    pub const SKIP_REPLICATION: WsFlags = WsFlags(1 << 5);

    const ALL: u32 = 0b11_1111;

    /// No flags
    pub const fn empty() -> Self {
        WsFlags(0)
    }

    /// Raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones
    pub fn from_bits_truncate(bits: u32) -> Self {
        WsFlags(bits & Self::ALL)
    }

    /// True if every bit of `other` is set
    pub fn contains(&self, other: WsFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: WsFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn remove(&mut self, other: WsFlags) {
        self.0 &= !other.0;
    }

    /// The write-set opens a transaction
    pub fn starts_transaction(&self) -> bool {
        self.contains(Self::START_TRANSACTION)
    }

    /// The write-set commits its transaction
    pub fn commits(&self) -> bool {
        self.contains(Self::COMMIT)
    }

    /// The write-set rolls its transaction back
    pub fn rolls_back(&self) -> bool {
        self.contains(Self::ROLLBACK)
    }

    /// Total order isolation action
    pub fn is_toi(&self) -> bool {
        self.contains(Self::ISOLATION)
    }
}

impl BitOr for WsFlags {
    type Output = WsFlags;

    fn bitor(self, rhs: WsFlags) -> WsFlags {
        WsFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for WsFlags {
    fn bitor_assign(&mut self, rhs: WsFlags) {
        self.0 |= rhs.0;
    }
}

/// Provider-side handle of a write-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WsHandle {
    /// Transaction the write-set belongs to
    pub transaction_id: TransactionId,
    /// Provider private value
    pub opaque: u64,
}

impl WsHandle {
    /// Create a handle
    pub fn new(transaction_id: TransactionId, opaque: u64) -> Self {
        Self {
            transaction_id,
            opaque,
        }
    }
}

/// Metadata delivered with a write-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WsMeta {
    /// Global position (seqno may be undefined)
    pub gtid: Gtid,
    /// Originating node
    pub server_id: ServerId,
    /// Originator-local transaction id
    pub transaction_id: TransactionId,
    /// Flag bitset
    pub flags: WsFlags,
}

impl WsMeta {
    /// Create metadata
    pub fn new(gtid: Gtid, server_id: ServerId, transaction_id: TransactionId, flags: WsFlags) -> Self {
        Self {
            gtid,
            server_id,
            transaction_id,
            flags,
        }
    }

    /// Seqno of the write-set
    pub fn seqno(&self) -> Seqno {
        self.gtid.seqno
    }

    /// True if the provider assigned a position
    pub fn is_ordered(&self) -> bool {
        !self.gtid.seqno.is_undefined()
    }
}

/// A delivered write-set
///
/// The payload is a buffer of serialized events (see [`crate::codec`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSet {
    /// Provider handle
    pub handle: WsHandle,
    /// Write-set metadata
    pub meta: WsMeta,
    /// Serialized events
    pub data: Vec<u8>,
}

/// Status codes returned by the replication provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderStatus {
    /// Operation succeeded
    Success,
    /// Succeeded with a warning
    Warning,
    /// Provider has no record of the transaction
    TransactionMissing,
    /// Certification failed, transaction must roll back
    CertificationFailed,
    /// Transaction was aborted by a conflicting high-priority action
    BfAbort,
    /// Not connected to the group
    ConnectionFailed,
    /// Provider must be restarted
    Fatal,
    /// Anything else
    Unknown,
}

impl ProviderStatus {
    /// True for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderStatus::Success)
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderStatus::Success => "success",
            ProviderStatus::Warning => "warning",
            ProviderStatus::TransactionMissing => "transaction missing",
            ProviderStatus::CertificationFailed => "certification failed",
            ProviderStatus::BfAbort => "brute force abort",
            ProviderStatus::ConnectionFailed => "connection failed",
            ProviderStatus::Fatal => "fatal",
            ProviderStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
