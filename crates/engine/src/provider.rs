//! Replication provider interface
//!
//! The provider delivers totally ordered, certified write-sets to applier
//! threads and certifies local transactions. The node exposes its upcall
//! surface to the provider through [`ApplierUpcall`] (one per applier
//! thread) and [`HighPriorityService`] (for replay).

use crate::service::HighPriorityService;
use replicore_core::{ProviderStatus, Result, ServerId, TransactionId, WriteSet, WsFlags, WsHandle, WsMeta};

/// Entry point the provider calls for every delivered write-set
pub trait ApplierUpcall {
    /// Apply one write-set
    fn on_apply(&mut self, ws: &WriteSet) -> Result<()>;

    /// True once the applier thread should stop consuming
    fn must_exit(&self) -> bool;
}

/// A local transaction submitted for certification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificationRequest {
    /// Handle identifying the transaction to the provider
    pub handle: WsHandle,
    /// Originating node
    pub server_id: ServerId,
    /// Originator-local transaction id
    pub transaction_id: TransactionId,
    /// Write-set flags
    pub flags: WsFlags,
    /// Serialized events
    pub data: Vec<u8>,
}

/// Certification verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Certification {
    /// Verdict
    pub status: ProviderStatus,
    /// Metadata with the assigned position (undefined if none was assigned)
    pub meta: WsMeta,
}

/// The group replication provider
pub trait Provider: Send + Sync {
    /// Deliver write-sets to `upcall` until the provider closes or the
    /// upcall asks to exit
    fn run_applier(&self, upcall: &mut dyn ApplierUpcall) -> Result<()>;

    /// Order and certify a local transaction
    fn certify(&self, request: CertificationRequest) -> Certification;

    /// Re-apply a certified transaction through `service`
    fn replay(&self, handle: WsHandle, service: &mut dyn HighPriorityService) -> ProviderStatus;

    /// Stop delivering; `run_applier` returns once the queue is drained
    fn close(&self);
}
