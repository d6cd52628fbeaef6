// src/poller.rs
use std::sync::Arc;
use std::time::Duration;

use ethers::types::H256;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundler::BundlerClient;
use crate::chain::ChainClient;
use crate::checker::{fail, TransactionStatusChecker};
use crate::config::PollSettings;
use crate::contracts::EntryPointLogs;
use crate::observer::StatusObserver;
use crate::revert;
use crate::types::{FailureKind, OperationRecord, OperationStatus, UserOperationReceipt};

/// Sleeps for `duration` unless `cancel` fires first. Returns false when
/// cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Drives one submitted operation from its hash to a verdict.
pub struct ReceiptPoller<B, C> {
    bundler: Arc<B>,
    checker: TransactionStatusChecker<C>,
    settings: PollSettings,
}

impl<B: BundlerClient, C: ChainClient> ReceiptPoller<B, C> {
    pub fn new(bundler: Arc<B>, chain: Arc<C>, settings: PollSettings) -> Self {
        Self {
            bundler,
            checker: TransactionStatusChecker::new(chain, settings.clone()),
            settings,
        }
    }

    /// Polls the bundler for the receipt of `op_hash`, one request at a time.
    ///
    /// Terminal state and cancellation are checked before every attempt, so
    /// a settled `record` is never touched again. When the bundler budget
    /// runs out, the hash is tried as a transaction hash on the chain.
    pub async fn poll(
        &self,
        op_hash: H256,
        record: &mut OperationRecord,
        observer: &dyn StatusObserver,
        cancel: &CancellationToken,
    ) -> OperationStatus {
        let max = self.settings.max_bundler_attempts;
        for attempt in 1..=max {
            if record.is_terminal() || cancel.is_cancelled() {
                return record.status;
            }
            record.poll_attempts = attempt;
            observer.on_poll_attempt(op_hash, attempt);

            match self.bundler.get_user_operation_receipt(op_hash).await {
                Ok(Some(receipt)) => {
                    self.settle(op_hash, receipt, record, observer, cancel).await;
                    return record.status;
                }
                Ok(None) => debug!("No receipt for {:?} yet ({}/{})", op_hash, attempt, max),
                Err(err) if err.is_transient() => {
                    warn!("Receipt lookup for {:?} failed ({}/{}): {}", op_hash, attempt, max, err)
                }
                Err(err) => {
                    fail(record, observer, FailureKind::Bundler, err.to_string());
                    return record.status;
                }
            }

            if attempt < max && !sleep_or_cancel(self.settings.bundler_interval, cancel).await {
                return record.status;
            }
        }

        if record.is_terminal() || cancel.is_cancelled() {
            return record.status;
        }
        info!(
            "No bundler receipt for {:?} after {} attempts, checking the chain directly",
            op_hash, max
        );
        self.checker.check(op_hash, record, observer, cancel).await
    }

    async fn settle(
        &self,
        op_hash: H256,
        receipt: UserOperationReceipt,
        record: &mut OperationRecord,
        observer: &dyn StatusObserver,
        cancel: &CancellationToken,
    ) {
        let tx_hash = receipt.bundled_transaction_hash();
        if let Some(tx_hash) = tx_hash {
            record.bundled_tx_hash = Some(tx_hash);
            observer.on_receipt_hash(op_hash, tx_hash);
        }

        let aa = EntryPointLogs::parse(receipt.logs(), op_hash.0);
        let decoded = aa.revert_reason().map(|bytes| revert::decode(Some(bytes)));
        if let Some(reason) = &decoded {
            // Provisional until the operation settles; a success clears it.
            record.failure_reason = Some(reason.clone());
            observer.on_failure_reason(op_hash, reason);
        }

        let event_failed = aa.user_operation.as_ref().is_some_and(|e| !e.success);
        if event_failed || receipt.success == Some(false) {
            let kind = if aa.post_op_revert.is_some() {
                FailureKind::PostOpRevert
            } else {
                FailureKind::UserOperationRevert
            };
            let reason = decoded
                .or(receipt.reason.filter(|r| !r.is_empty()))
                .unwrap_or_else(|| "UserOperation execution failed".to_string());
            fail(record, observer, kind, reason);
            return;
        }

        match tx_hash {
            Some(tx_hash) => {
                self.checker.check(tx_hash, record, observer, cancel).await;
            }
            None => {
                if record.succeed() {
                    observer.on_status_change(op_hash, record.status);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ethers::abi::{encode, Token};
    use ethers::types::{Address, Transaction, TransactionReceipt, U256};

    use super::*;
    use crate::bundler::MockBundlerClient;
    use crate::chain::MockChainClient;
    use crate::contracts::test_logs;
    use crate::error::BundlerError;
    use crate::observer::NoopObserver;
    use crate::types::{BundledReceipt, OperationKind};

    const OP_HASH: H256 = H256::repeat_byte(0x0a);
    const TX_HASH: H256 = H256::repeat_byte(0x0b);

    fn entry_point() -> Address {
        Address::repeat_byte(0xee)
    }

    fn token() -> Address {
        Address::repeat_byte(0x70)
    }

    fn settings() -> PollSettings {
        PollSettings {
            bundler_interval: Duration::from_millis(1500),
            max_bundler_attempts: 5,
            chain_initial_delay: Duration::from_millis(100),
            chain_retry_interval: Duration::from_millis(100),
            max_chain_attempts: 2,
            ..Default::default()
        }
    }

    fn bundler_receipt(success: bool, logs: Vec<ethers::types::Log>) -> UserOperationReceipt {
        let mut logs = logs;
        logs.push(test_logs::user_operation_event(entry_point(), OP_HASH, success));
        UserOperationReceipt {
            user_op_hash: Some(OP_HASH),
            success: Some(success),
            receipt: Some(BundledReceipt {
                transaction_hash: Some(TX_HASH),
                logs,
            }),
            ..Default::default()
        }
    }

    fn chain_with_transfer() -> MockChainClient {
        let mut chain = MockChainClient::new();
        chain.expect_transaction_receipt().returning(|_| {
            Ok(Some(TransactionReceipt {
                transaction_hash: TX_HASH,
                status: Some(1u64.into()),
                gas_used: Some(U256::from(60_000u64)),
                logs: vec![
                    test_logs::transfer(token(), Address::repeat_byte(1), Address::repeat_byte(2), 10),
                    test_logs::user_operation_event(entry_point(), OP_HASH, true),
                ],
                ..Default::default()
            }))
        });
        chain.expect_transaction().returning(|_| {
            Ok(Some(Transaction {
                hash: TX_HASH,
                gas: U256::from(200_000u64),
                ..Default::default()
            }))
        });
        chain
    }

    fn record() -> OperationRecord {
        OperationRecord::new(OP_HASH, OperationKind::Transfer { token: token() })
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_after_three_empty_polls_settles_once() {
        let mut bundler = MockBundlerClient::new();
        let mut seq = mockall::Sequence::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        bundler
            .expect_get_user_operation_receipt()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(bundler_receipt(true, vec![]))));

        let poller = ReceiptPoller::new(Arc::new(bundler), Arc::new(chain_with_transfer()), settings());
        let mut record = record();
        let status = poller
            .poll(OP_HASH, &mut record, &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(status, OperationStatus::Success);
        assert_eq!(record.poll_attempts, 4);
        assert_eq!(record.bundled_tx_hash, Some(TX_HASH));
        assert_eq!(record.failure_reason, None);

        // Late timers find nothing scheduled, and a re-poll of a settled
        // record is a no-op (the mock would panic on a fifth lookup).
        tokio::time::advance(Duration::from_secs(60)).await;
        let again = poller
            .poll(OP_HASH, &mut record, &NoopObserver, &CancellationToken::new())
            .await;
        assert_eq!(again, OperationStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn bundler_json_rpc_error_is_terminal() {
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(1)
            .returning(|_| {
                Err(BundlerError::JsonRpc {
                    code: -32602,
                    message: "invalid userOpHash".into(),
                })
            });

        let poller = ReceiptPoller::new(Arc::new(bundler), Arc::new(MockChainClient::new()), settings());
        let mut record = record();
        poller
            .poll(OP_HASH, &mut record, &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(record.failure, Some(FailureKind::Bundler));
        assert_eq!(record.failure_reason.as_deref(), Some("Bundler error: invalid userOpHash"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_user_operation_event_carries_decoded_reason() {
        let mut reason = vec![0x08, 0xc3, 0x79, 0xa0];
        reason.extend(encode(&[Token::String("ERC20: transfer amount exceeds balance".into())]));
        let revert_log = test_logs::user_operation_revert(entry_point(), OP_HASH, reason);

        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(1)
            .returning(move |_| Ok(Some(bundler_receipt(false, vec![revert_log.clone()]))));

        let poller = ReceiptPoller::new(Arc::new(bundler), Arc::new(MockChainClient::new()), settings());
        let mut record = record();
        poller
            .poll(OP_HASH, &mut record, &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(record.failure, Some(FailureKind::UserOperationRevert));
        assert_eq!(
            record.failure_reason.as_deref(),
            Some("ERC20: transfer amount exceeds balance")
        );
        assert_eq!(record.bundled_tx_hash, Some(TX_HASH));
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_without_transaction_hash_is_success() {
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .returning(|_| {
                Ok(Some(UserOperationReceipt {
                    success: Some(true),
                    ..Default::default()
                }))
            });

        let poller = ReceiptPoller::new(Arc::new(bundler), Arc::new(MockChainClient::new()), settings());
        let mut record = record();
        let status = poller
            .poll(OP_HASH, &mut record, &NoopObserver, &CancellationToken::new())
            .await;
        assert_eq!(status, OperationStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bundler_falls_back_to_chain() {
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(5)
            .returning(|_| Err(BundlerError::Transport("connection refused".into())));

        let mut chain = MockChainClient::new();
        chain
            .expect_transaction_receipt()
            .withf(|hash| *hash == OP_HASH)
            .times(2)
            .returning(|_| Ok(None));
        chain.expect_transaction().times(2).returning(|_| Ok(None));

        let poller = ReceiptPoller::new(Arc::new(bundler), Arc::new(chain), settings());
        let mut record = record();
        poller
            .poll(OP_HASH, &mut record, &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(record.poll_attempts, 5);
        assert_eq!(record.failure, Some(FailureKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_polls() {
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(1)
            .returning(|_| Ok(None));

        let poller = Arc::new(ReceiptPoller::new(
            Arc::new(bundler),
            Arc::new(MockChainClient::new()),
            settings(),
        ));
        let cancel = CancellationToken::new();
        let task = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut record = record();
                poller.poll(OP_HASH, &mut record, &NoopObserver, &cancel).await;
                record
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        let record = task.await.unwrap();
        assert_eq!(record.status, OperationStatus::Pending);
        assert_eq!(record.poll_attempts, 1);
    }
}
