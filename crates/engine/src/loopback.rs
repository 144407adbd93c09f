//! Loopback provider: a single-node stand-in for the group provider
//!
//! Write-sets are delivered from an in-process queue in the order they were
//! submitted. Certification assigns the next seqno and succeeds unless a
//! verdict was scripted with [`LoopbackProvider::script_certification`].
//! Certified local write-sets are remembered so they can be replayed.

use crate::provider::{ApplierUpcall, Certification, CertificationRequest, Provider};
use crate::service::HighPriorityService;
use parking_lot::{Condvar, Mutex};
use replicore_core::{
    Gtid, ProviderStatus, ReplicationError, Result, Seqno, ServerId, TransactionId, WriteSet,
    WsFlags, WsHandle, WsMeta,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
struct Delivery {
    queue: VecDeque<WriteSet>,
    in_flight: usize,
    closed: bool,
}

/// Counters of a loopback provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Write-sets handed to appliers
    pub delivered: u64,
    /// Write-sets applied without error
    pub applied: u64,
    /// Write-sets whose upcall failed
    pub failed: u64,
}

/// In-process provider for a single node
#[derive(Debug)]
pub struct LoopbackProvider {
    group_id: ServerId,
    next_seqno: AtomicI64,
    delivery: Mutex<Delivery>,
    ready: Condvar,
    idle: Condvar,
    verdicts: Mutex<VecDeque<ProviderStatus>>,
    replay_verdicts: Mutex<VecDeque<ProviderStatus>>,
    certified: Mutex<Vec<WriteSet>>,
    delivered: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackProvider {
    /// Provider whose first seqno is 1
    pub fn new() -> Self {
        Self::starting_after(Seqno::new(0))
    }

    /// Provider continuing after `position`
    pub fn starting_after(position: Seqno) -> Self {
        Self {
            group_id: ServerId::new(),
            next_seqno: AtomicI64::new(position.get().max(0) + 1),
            delivery: Mutex::new(Delivery::default()),
            ready: Condvar::new(),
            idle: Condvar::new(),
            verdicts: Mutex::new(VecDeque::new()),
            replay_verdicts: Mutex::new(VecDeque::new()),
            certified: Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Cluster state id stamped on every gtid
    pub fn group_id(&self) -> ServerId {
        self.group_id
    }

    fn assign_seqno(&self) -> Seqno {
        Seqno::new(self.next_seqno.fetch_add(1, Ordering::SeqCst))
    }

    /// Order and enqueue a remote write-set; returns its metadata
    pub fn deliver(&self, server_id: ServerId, transaction_id: TransactionId, flags: WsFlags, data: Vec<u8>) -> WsMeta {
        let meta = WsMeta::new(
            Gtid::new(self.group_id, self.assign_seqno()),
            server_id,
            transaction_id,
            flags,
        );
        self.deliver_write_set(WriteSet {
            handle: WsHandle::new(transaction_id, 0),
            meta,
            data,
        });
        meta
    }

    /// Enqueue a write-set without assigning a position
    pub fn deliver_unordered(&self, server_id: ServerId, transaction_id: TransactionId, flags: WsFlags, data: Vec<u8>) -> WsMeta {
        let meta = WsMeta::new(Gtid::undefined(), server_id, transaction_id, flags);
        self.deliver_write_set(WriteSet {
            handle: WsHandle::new(transaction_id, 0),
            meta,
            data,
        });
        meta
    }

    /// Enqueue a prepared write-set as is
    pub fn deliver_write_set(&self, ws: WriteSet) {
        let mut delivery = self.delivery.lock();
        if delivery.closed {
            warn!(target: "replicore::provider", seqno = ws.meta.seqno().get(), "provider closed, write set dropped");
            return;
        }
        delivery.queue.push_back(ws);
        drop(delivery);
        self.ready.notify_one();
    }

    /// Verdict for the next certification (defaults to success)
    pub fn script_certification(&self, status: ProviderStatus) {
        self.verdicts.lock().push_back(status);
    }

    /// Verdict for the next replay, returned without applying
    pub fn script_replay(&self, status: ProviderStatus) {
        self.replay_verdicts.lock().push_back(status);
    }

    /// Local write-sets certified so far
    pub fn certified(&self) -> Vec<WriteSet> {
        self.certified.lock().clone()
    }

    /// Write-sets waiting for an applier
    pub fn pending(&self) -> usize {
        self.delivery.lock().queue.len()
    }

    /// Wait until every delivered write-set was processed
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut delivery = self.delivery.lock();
        while !delivery.queue.is_empty() || delivery.in_flight > 0 {
            if self.idle.wait_until(&mut delivery, deadline).timed_out() {
                return delivery.queue.is_empty() && delivery.in_flight == 0;
            }
        }
        true
    }

    /// Counters
    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn next_write_set(&self) -> Option<WriteSet> {
        let mut delivery = self.delivery.lock();
        loop {
            if let Some(ws) = delivery.queue.pop_front() {
                delivery.in_flight += 1;
                return Some(ws);
            }
            if delivery.closed {
                return None;
            }
            self.ready.wait(&mut delivery);
        }
    }

    fn finished(&self) {
        let mut delivery = self.delivery.lock();
        delivery.in_flight -= 1;
        let idle = delivery.queue.is_empty() && delivery.in_flight == 0;
        drop(delivery);
        if idle {
            self.idle.notify_all();
        }
    }
}

impl Provider for LoopbackProvider {
    fn close(&self) {
        self.delivery.lock().closed = true;
        self.ready.notify_all();
    }

    fn run_applier(&self, upcall: &mut dyn ApplierUpcall) -> Result<()> {
        while let Some(ws) = self.next_write_set() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            let result = upcall.on_apply(&ws);
            self.finished();
            match result {
                Ok(()) => {
                    self.applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_fatal() => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(target: "replicore::provider", seqno = ws.meta.seqno().get(), error = %e, "fatal apply error");
                    return Err(e);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "replicore::provider", seqno = ws.meta.seqno().get(), error = %e, "write set apply failed");
                }
            }
            if upcall.must_exit() {
                debug!(target: "replicore::provider", "applier asked to exit");
                break;
            }
        }
        Ok(())
    }

    fn certify(&self, request: CertificationRequest) -> Certification {
        let status = self
            .verdicts
            .lock()
            .pop_front()
            .unwrap_or(ProviderStatus::Success);
        let seqno = match status {
            ProviderStatus::Success | ProviderStatus::CertificationFailed => self.assign_seqno(),
            _ => Seqno::UNDEFINED,
        };
        let meta = WsMeta::new(
            Gtid::new(self.group_id, seqno),
            request.server_id,
            request.transaction_id,
            request.flags,
        );
        if status.is_success() {
            self.certified.lock().push(WriteSet {
                handle: request.handle,
                meta,
                data: request.data,
            });
        }
        debug!(
            target: "replicore::provider",
            trx = %request.transaction_id,
            seqno = seqno.get(),
            status = %status,
            "certified"
        );
        Certification { status, meta }
    }

    fn replay(&self, handle: WsHandle, service: &mut dyn HighPriorityService) -> ProviderStatus {
        let ws = self
            .certified
            .lock()
            .iter()
            .rev()
            .find(|ws| ws.handle == handle)
            .cloned();
        let Some(ws) = ws else {
            warn!(target: "replicore::provider", trx = %handle.transaction_id, "nothing to replay");
            return ProviderStatus::TransactionMissing;
        };

        if let Some(status) = self.replay_verdicts.lock().pop_front() {
            if !status.is_success() {
                if let Err(e) = service.rollback(ws.handle, &ws.meta) {
                    warn!(target: "replicore::provider", error = %e, "replay rollback failed");
                }
                service.after_apply();
                return status;
            }
        }

        let result = service
            .apply_write_set(&ws.meta, &ws.data)
            .and_then(|_| service.commit(ws.handle, &ws.meta));
        let status = match result {
            Ok(()) => ProviderStatus::Success,
            Err(ReplicationError::CertificationConflict(_)) => ProviderStatus::CertificationFailed,
            Err(e) => {
                warn!(target: "replicore::provider", seqno = ws.meta.seqno().get(), error = %e, "replay apply failed");
                if let Err(e) = service.rollback(ws.handle, &ws.meta) {
                    warn!(target: "replicore::provider", error = %e, "replay rollback failed");
                }
                ProviderStatus::Fatal
            }
        };
        service.after_apply();
        status
    }
}
