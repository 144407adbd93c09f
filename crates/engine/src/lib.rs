//! Replication engine for replicore
//!
//! This crate turns certified write-sets into local transactions:
//! - Apply loop: decode and execute the events of one write-set
//! - Services: applier, replayer and storage services behind the
//!   `HighPriorityService` upcall surface
//! - ServerContext: session pool, streaming appliers, forced-abort signal
//! - AbortCoordinator: rollbacker and post-rollbacker threads
//! - ClientSession: local transactions certified through the provider
//! - LoopbackProvider: single-node provider for tests and tooling
//!
//! The engine is the only component that knows about:
//! - Commit ordering across appliers and clients
//! - Streaming transactions and their recovery
//! - Conflict resolution between high-priority and local work

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply;
pub mod applier;
pub mod appliers;
pub mod client;
pub mod config;
pub mod high_priority;
pub mod loopback;
pub mod node;
pub mod provider;
pub mod replayer;
pub mod rollbacker;
pub mod server;
pub mod service;
pub mod storage_service;

pub use apply::{apply_events, dump_write_set, AppliedEvents};
pub use applier::ApplierService;
pub use appliers::{start_appliers, ApplierThreads};
pub use client::ClientSession;
pub use config::{ReplicationConfig, CONFIG_FILE_NAME};
pub use high_priority::{HighPriorityContext, NonTransMode, RelayLogInfo};
pub use loopback::{LoopbackProvider, LoopbackStats};
pub use node::Node;
pub use provider::{ApplierUpcall, Certification, CertificationRequest, Provider};
pub use replayer::ReplayerService;
pub use rollbacker::AbortCoordinator;
pub use server::{AbortRequest, ServerContext, StreamingApplier};
pub use service::HighPriorityService;
pub use storage_service::StorageService;

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(ServerContext: Send, Sync);
    static_assertions::assert_impl_all!(LoopbackProvider: Send, Sync);
    static_assertions::assert_impl_all!(AbortCoordinator: Send, Sync);
    static_assertions::assert_impl_all!(ApplierService: Send);
    static_assertions::assert_impl_all!(Node: Send, Sync);
}
