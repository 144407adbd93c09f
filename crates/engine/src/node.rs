//! A running cluster node
//!
//! [`Node`] wires the server context to a provider: it starts the abort
//! coordinator, reopens streaming transactions left in the streaming log,
//! then starts the applier threads.

use crate::appliers::{start_appliers, ApplierThreads};
use crate::client::ClientSession;
use crate::config::ReplicationConfig;
use crate::provider::Provider;
use crate::rollbacker::AbortCoordinator;
use crate::server::ServerContext;
use parking_lot::Mutex;
use replicore_core::{Gtid, Result};
use replicore_storage::MemoryEngine;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Server context, provider and background threads of one node
pub struct Node {
    server: Arc<ServerContext>,
    provider: Arc<dyn Provider>,
    appliers: Mutex<Option<ApplierThreads>>,
    coordinator: AbortCoordinator,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("server", &self.server)
            .field("appliers", &self.appliers.lock().as_ref().map(|a| a.len()))
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Start a node on an existing server context
    ///
    /// # Errors
    ///
    /// `Io` if a background thread cannot be spawned, or a storage error
    /// while recovering streaming transactions.
    pub fn start(server: Arc<ServerContext>, provider: Arc<dyn Provider>) -> Result<Self> {
        let coordinator = AbortCoordinator::start(&server)?;
        let recovered = server.recover_streaming_appliers()?;
        let appliers = start_appliers(&server, Arc::clone(&provider), server.config().applier_threads)?;
        info!(
            target: "replicore::server",
            node = %server.node_id(),
            appliers = appliers.len(),
            recovered,
            "node started"
        );
        Ok(Self {
            server,
            provider,
            appliers: Mutex::new(Some(appliers)),
            coordinator,
        })
    }

    /// Start a node on an empty in-memory engine
    pub fn in_memory(config: ReplicationConfig, provider: Arc<dyn Provider>) -> Result<Self> {
        Self::start(ServerContext::in_memory(config)?, provider)
    }

    /// Start a node on the engine image in `checkpoint`, resuming at `position`
    pub fn from_checkpoint(
        config: ReplicationConfig,
        checkpoint: &Path,
        position: Gtid,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        let engine = Arc::new(MemoryEngine::open(checkpoint, config.lock_wait_timeout())?);
        Self::start(ServerContext::new(config, engine, position)?, provider)
    }

    /// The node's server context
    pub fn server(&self) -> &Arc<ServerContext> {
        &self.server
    }

    /// Open a client connection
    pub fn client(&self) -> ClientSession {
        ClientSession::connect(&self.server, Arc::clone(&self.provider))
    }

    /// Write the committed engine state to `path`
    pub fn checkpoint(&self, path: &Path) -> Result<Gtid> {
        let position = self.server.checkpoint();
        self.server.engine().checkpoint(path)?;
        info!(target: "replicore::server", seqno = position.seqno.get(), path = %path.display(), "checkpoint written");
        Ok(position)
    }

    /// Stop the provider, wait for the appliers, then stop the abort
    /// coordinator
    ///
    /// # Errors
    ///
    /// The first applier thread failure.
    pub fn shutdown(&self) -> Result<()> {
        self.provider.close();
        let result = match self.appliers.lock().take() {
            Some(appliers) => appliers.join(),
            None => Ok(()),
        };
        self.coordinator.shutdown();
        info!(target: "replicore::server", node = %self.server.node_id(), "node stopped");
        result
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.appliers.lock().is_some() {
            let _ = self.shutdown();
        }
    }
}
