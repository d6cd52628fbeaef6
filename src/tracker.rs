// src/tracker.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use ethers::types::H256;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundler::BundlerClient;
use crate::chain::ChainClient;
use crate::observer::WatchObserver;
use crate::poller::ReceiptPoller;
use crate::types::{OperationKind, OperationRecord};

/// How long a stopped chain's last snapshot stays queryable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

struct Entry {
    rx: watch::Receiver<OperationRecord>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    stopped_at: Arc<OnceLock<Instant>>,
}

impl Entry {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn stopped_at(&self) -> Option<Instant> {
        self.stopped_at.get().copied()
    }
}

/// Keeps at most one poll chain per operation hash and the latest snapshot
/// of each. Stopped chains are forgotten after the retention window, and
/// the oldest stopped ones go first once the map is full.
pub struct OperationTracker<B, C> {
    poller: Arc<ReceiptPoller<B, C>>,
    entries: Mutex<HashMap<H256, Entry>>,
    shutdown: CancellationToken,
    retention: Duration,
    max_entries: usize,
}

impl<B, C> OperationTracker<B, C>
where
    B: BundlerClient + 'static,
    C: ChainClient + 'static,
{
    pub fn new(poller: Arc<ReceiptPoller<B, C>>) -> Self {
        Self::with_limits(poller, DEFAULT_RETENTION, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_limits(
        poller: Arc<ReceiptPoller<B, C>>,
        retention: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            poller,
            entries: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            retention,
            max_entries: max_entries.max(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<H256, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops expired entries, then the oldest stopped ones while the map is
    /// at capacity. Running chains are never evicted.
    fn evict(&self, entries: &mut HashMap<H256, Entry>) {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| {
            e.stopped_at()
                .map_or(true, |at| now.saturating_duration_since(at) < self.retention)
        });

        if entries.len() >= self.max_entries {
            let mut stopped: Vec<(Instant, H256)> = entries
                .iter()
                .filter_map(|(hash, e)| e.stopped_at().map(|at| (at, *hash)))
                .collect();
            stopped.sort();
            let excess = entries.len() + 1 - self.max_entries;
            for (_, hash) in stopped.into_iter().take(excess) {
                entries.remove(&hash);
            }
            if entries.len() >= self.max_entries {
                warn!("{} operations are being tracked concurrently", entries.len());
            }
        }

        if entries.len() < before {
            debug!("Evicted {} tracked operations", before - entries.len());
        }
    }

    /// Starts tracking `hash`, or re-enters the chain already running for it.
    ///
    /// A settled operation is returned as is. A chain that stopped without a
    /// verdict (cancelled) is restarted from its last snapshot. A `Generic`
    /// kind never overrides the kind an earlier call supplied.
    pub fn track(&self, hash: H256, kind: OperationKind) -> OperationRecord {
        let mut entries = self.entries();
        self.evict(&mut entries);

        let mut record = match entries.get(&hash) {
            Some(entry) => {
                let snapshot = entry.rx.borrow().clone();
                if entry.is_running() || snapshot.is_terminal() {
                    debug!("Re-entering tracking of {:?}", hash);
                    return snapshot;
                }
                snapshot
            }
            None => OperationRecord::new(hash, kind.clone()),
        };
        if kind != OperationKind::Generic {
            record.kind = kind;
        }

        let (tx, rx) = watch::channel(record.clone());
        let cancel = self.shutdown.child_token();
        let stopped_at = Arc::new(OnceLock::new());
        let handle = tokio::spawn({
            let poller = self.poller.clone();
            let cancel = cancel.clone();
            let stopped_at = stopped_at.clone();
            let mut record = record.clone();
            async move {
                let observer = WatchObserver::new(tx);
                poller.poll(hash, &mut record, &observer, &cancel).await;
                let _ = stopped_at.set(Instant::now());
                observer.publish(&record);
            }
        });
        info!("Tracking operation {:?} ({:?})", hash, record.kind);

        entries.insert(
            hash,
            Entry {
                rx,
                cancel,
                handle,
                stopped_at,
            },
        );
        record
    }

    /// Latest snapshot, if `hash` was ever tracked.
    pub fn status(&self, hash: H256) -> Option<OperationRecord> {
        self.entries().get(&hash).map(|e| e.rx.borrow().clone())
    }

    pub fn subscribe(&self, hash: H256) -> Option<watch::Receiver<OperationRecord>> {
        self.entries().get(&hash).map(|e| e.rx.clone())
    }

    /// Waits until the chain for `hash` stops and returns its final snapshot.
    pub async fn wait(&self, hash: H256) -> Option<OperationRecord> {
        let mut rx = self.subscribe(hash)?;
        // An error means the chain ended without a verdict; the last value stands.
        let _ = rx.wait_for(|r| r.is_terminal()).await;
        let snapshot = rx.borrow().clone();
        Some(snapshot)
    }

    /// Stops the chain for `hash`. Returns false if none is running.
    pub fn cancel(&self, hash: H256) -> bool {
        match self.entries().get(&hash) {
            Some(entry) if entry.is_running() => {
                info!("Cancelling tracking of {:?}", hash);
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stops every chain, including ones started after this call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bundler::MockBundlerClient;
    use crate::chain::MockChainClient;
    use crate::config::PollSettings;
    use crate::types::{FailureKind, OperationStatus, UserOperationReceipt};

    const HASH: H256 = H256::repeat_byte(0x42);

    fn settings() -> PollSettings {
        PollSettings {
            bundler_interval: Duration::from_secs(1),
            max_bundler_attempts: 3,
            chain_initial_delay: Duration::from_secs(1),
            chain_retry_interval: Duration::from_secs(1),
            max_chain_attempts: 1,
            ..Default::default()
        }
    }

    fn tracker(bundler: MockBundlerClient, chain: MockChainClient) -> OperationTracker<MockBundlerClient, MockChainClient> {
        OperationTracker::new(Arc::new(ReceiptPoller::new(
            Arc::new(bundler),
            Arc::new(chain),
            settings(),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_track_joins_running_chain() {
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(3)
            .returning(|_| Ok(None));
        let mut chain = MockChainClient::new();
        chain.expect_transaction_receipt().times(1).returning(|_| Ok(None));
        chain.expect_transaction().times(1).returning(|_| Ok(None));

        let tracker = tracker(bundler, chain);
        tracker.track(HASH, OperationKind::Generic);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let snapshot = tracker.track(HASH, OperationKind::Generic);
        assert_eq!(snapshot.status, OperationStatus::Pending);
        assert_eq!(snapshot.poll_attempts, 2);

        let done = tracker.wait(HASH).await.unwrap();
        assert_eq!(done.failure, Some(FailureKind::Timeout));
        assert_eq!(done.poll_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_operation_is_not_polled_again() {
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(1)
            .returning(|_| {
                Ok(Some(UserOperationReceipt {
                    success: Some(true),
                    ..Default::default()
                }))
            });

        let tracker = tracker(bundler, MockChainClient::new());
        tracker.track(HASH, OperationKind::Generic);
        let done = tracker.wait(HASH).await.unwrap();
        assert_eq!(done.status, OperationStatus::Success);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(tracker.track(HASH, OperationKind::Generic).status, OperationStatus::Success);
        assert!(!tracker.cancel(HASH));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_chain_stays_pending_and_can_restart() {
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(2)
            .returning(|_| Ok(None));

        let tracker = tracker(bundler, MockChainClient::new());
        tracker.track(HASH, OperationKind::Generic);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tracker.cancel(HASH));

        let stopped = tracker.wait(HASH).await.unwrap();
        assert_eq!(stopped.status, OperationStatus::Pending);
        assert_eq!(stopped.poll_attempts, 1);

        let token = ethers::types::Address::repeat_byte(0x70);
        let restarted = tracker.track(HASH, OperationKind::Transfer { token });
        assert_eq!(restarted.kind, OperationKind::Transfer { token });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracker.shutdown();
        let stopped = tracker.wait(HASH).await.unwrap();
        assert_eq!(stopped.status, OperationStatus::Pending);
    }

    fn settles_immediately() -> MockBundlerClient {
        let mut bundler = MockBundlerClient::new();
        bundler.expect_get_user_operation_receipt().returning(|_| {
            Ok(Some(UserOperationReceipt {
                success: Some(true),
                ..Default::default()
            }))
        });
        bundler
    }

    #[tokio::test(start_paused = true)]
    async fn settled_entries_expire_after_retention() {
        let poller = ReceiptPoller::new(
            Arc::new(settles_immediately()),
            Arc::new(MockChainClient::new()),
            settings(),
        );
        let tracker = OperationTracker::with_limits(Arc::new(poller), Duration::from_secs(60), 100);
        let other = H256::repeat_byte(0x43);

        tracker.track(HASH, OperationKind::Generic);
        tracker.wait(HASH).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        tracker.track(other, OperationKind::Generic);
        assert!(tracker.status(HASH).is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        tracker.track(other, OperationKind::Generic);
        assert!(tracker.status(HASH).is_none());
        assert!(tracker.status(other).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn full_tracker_evicts_oldest_stopped_entry() {
        let poller = ReceiptPoller::new(
            Arc::new(settles_immediately()),
            Arc::new(MockChainClient::new()),
            settings(),
        );
        let tracker = OperationTracker::with_limits(Arc::new(poller), Duration::from_secs(3600), 2);
        let hashes = [H256::repeat_byte(0x01), H256::repeat_byte(0x02), H256::repeat_byte(0x03)];

        for hash in hashes {
            tracker.track(hash, OperationKind::Generic);
            tracker.wait(hash).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert!(tracker.status(hashes[0]).is_none());
        assert!(tracker.status(hashes[1]).is_some());
        assert!(tracker.status(hashes[2]).is_some());
    }

    #[test]
    fn unknown_hash_has_no_status() {
        let tracker = tracker(MockBundlerClient::new(), MockChainClient::new());
        assert!(tracker.status(HASH).is_none());
        assert!(!tracker.cancel(HASH));
    }
}
