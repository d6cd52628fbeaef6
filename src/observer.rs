// src/observer.rs
use ethers::types::H256;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::types::{FailureKind, OperationRecord, OperationStatus};

/// Receives progress of a poll chain. All methods default to no-ops, so an
/// implementor only overrides what it displays.
pub trait StatusObserver: Send + Sync {
    fn on_status_change(&self, _hash: H256, _status: OperationStatus) {}

    fn on_failure_reason(&self, _hash: H256, _reason: &str) {}

    /// Called once, before the status change that marks the failure.
    fn on_failure_kind(&self, _hash: H256, _kind: FailureKind) {}

    fn on_receipt_hash(&self, _hash: H256, _tx_hash: H256) {}

    fn on_poll_attempt(&self, _hash: H256, _attempt: u32) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StatusObserver for NoopObserver {}

/// Logs every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
    fn on_status_change(&self, hash: H256, status: OperationStatus) {
        info!("Operation {:?} is now {:?}", hash, status);
    }

    fn on_failure_reason(&self, hash: H256, reason: &str) {
        warn!("Operation {:?} failure reason: {}", hash, reason);
    }

    fn on_receipt_hash(&self, hash: H256, tx_hash: H256) {
        info!("Operation {:?} bundled in transaction {:?}", hash, tx_hash);
    }

    fn on_poll_attempt(&self, hash: H256, attempt: u32) {
        debug!("Polling receipt for {:?}, attempt {}", hash, attempt);
    }
}

/// Mirrors updates into a watch channel so other tasks can read the latest
/// snapshot of one operation.
#[derive(Debug)]
pub struct WatchObserver {
    tx: watch::Sender<OperationRecord>,
}

impl WatchObserver {
    pub fn new(tx: watch::Sender<OperationRecord>) -> Self {
        Self { tx }
    }

    pub fn publish(&self, record: &OperationRecord) {
        self.tx.send_replace(record.clone());
    }
}

impl StatusObserver for WatchObserver {
    fn on_status_change(&self, _hash: H256, status: OperationStatus) {
        self.tx.send_modify(|r| r.status = status);
    }

    fn on_failure_reason(&self, _hash: H256, reason: &str) {
        self.tx
            .send_modify(|r| r.failure_reason = Some(reason.to_string()));
    }

    fn on_failure_kind(&self, _hash: H256, kind: FailureKind) {
        self.tx.send_modify(|r| r.failure = Some(kind));
    }

    fn on_receipt_hash(&self, _hash: H256, tx_hash: H256) {
        self.tx.send_modify(|r| r.bundled_tx_hash = Some(tx_hash));
    }

    fn on_poll_attempt(&self, _hash: H256, attempt: u32) {
        self.tx.send_modify(|r| r.poll_attempts = attempt);
    }
}
