//! Applier threads
//!
//! Each thread owns one [`ApplierService`] on a pooled session and hands it
//! to the provider as the upcall for delivered write-sets. A thread stops
//! when the provider closes, when it consumes an exit request, or when
//! applying fails fatally.

use crate::applier::ApplierService;
use crate::provider::Provider;
use crate::server::ServerContext;
use crate::service::HighPriorityService;
use replicore_core::{ReplicationError, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Running applier threads
pub struct ApplierThreads {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for ApplierThreads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplierThreads")
            .field("threads", &self.handles.len())
            .finish()
    }
}

/// Spawn `count` applier threads consuming from `provider`
///
/// # Errors
///
/// `Io` if a thread cannot be spawned. Threads already started keep
/// running until the provider closes.
pub fn start_appliers(
    server: &Arc<ServerContext>,
    provider: Arc<dyn Provider>,
    count: usize,
) -> Result<ApplierThreads> {
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let server = Arc::clone(server);
        let provider = Arc::clone(&provider);
        let handle = thread::Builder::new()
            .name(format!("replicore-applier-{}", index))
            .spawn(move || applier_thread(&server, provider.as_ref(), index))?;
        handles.push(handle);
    }
    info!(target: "replicore::applier", count, "applier threads started");
    Ok(ApplierThreads { handles })
}

fn applier_thread(server: &Arc<ServerContext>, provider: &dyn Provider, index: usize) -> Result<()> {
    let mut service = ApplierService::new(Arc::clone(server), server.acquire_session());
    service.store_globals();
    server.applier_started();
    info!(target: "replicore::applier", thread = index, session = service.session().id(), "applier running");

    let result = provider.run_applier(&mut service);

    service.reset_globals();
    server.release_high_priority_service(service);
    server.applier_exited();
    match &result {
        Ok(()) => info!(target: "replicore::applier", thread = index, "applier stopped"),
        Err(e) => error!(target: "replicore::applier", thread = index, error = %e, "applier failed"),
    }
    result
}

impl ApplierThreads {
    /// Number of threads started
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if no thread was started
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every thread; returns the first failure
    pub fn join(self) -> Result<()> {
        let mut first = Ok(());
        for handle in self.handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(ReplicationError::InternalInconsistency("applier thread panicked".into())));
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}
