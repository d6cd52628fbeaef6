// src/checker.rs
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use ethers::types::{Address, Log, Transaction, TransactionReceipt, H256, U256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::config::PollSettings;
use crate::contracts::{
    is_event, ApprovalFilter, DecrementFilter, EntryPointLogs, IncrementFilter, TransferFilter,
};
use crate::observer::StatusObserver;
use crate::poller::sleep_or_cancel;
use crate::revert;
use crate::types::{FailureKind, OperationKind, OperationRecord, OperationStatus};

/// Contracts listed when logs came from somewhere other than the target.
const MAX_LISTED_EMITTERS: usize = 5;

/// Settles an operation from the chain's view of its bundle transaction.
pub struct TransactionStatusChecker<C> {
    client: Arc<C>,
    settings: PollSettings,
}

impl<C: ChainClient> TransactionStatusChecker<C> {
    pub fn new(client: Arc<C>, settings: PollSettings) -> Self {
        Self { client, settings }
    }

    /// Looks `tx_hash` up until it is mined (within the attempt budget) and
    /// classifies it into `record`. Returns the resulting status, which stays
    /// `Pending` only when cancelled.
    pub async fn check(
        &self,
        tx_hash: H256,
        record: &mut OperationRecord,
        observer: &dyn StatusObserver,
        cancel: &CancellationToken,
    ) -> OperationStatus {
        if !sleep_or_cancel(self.settings.chain_initial_delay, cancel).await {
            return record.status;
        }

        for attempt in 1..=self.settings.max_chain_attempts {
            if record.is_terminal() || cancel.is_cancelled() {
                return record.status;
            }

            match self.fetch(tx_hash).await {
                Ok(Some((receipt, tx))) => {
                    self.classify(&receipt, &tx, record, observer).await;
                    return record.status;
                }
                Ok(None) => debug!(
                    "Transaction {:?} not mined yet (attempt {}/{})",
                    tx_hash, attempt, self.settings.max_chain_attempts
                ),
                Err(err) => warn!(
                    "Chain lookup for {:?} failed (attempt {}/{}): {}",
                    tx_hash, attempt, self.settings.max_chain_attempts, err
                ),
            }

            if attempt < self.settings.max_chain_attempts
                && !sleep_or_cancel(self.settings.chain_retry_interval, cancel).await
            {
                return record.status;
            }
        }

        let reason = format!(
            "Transaction {:?} was not found on chain after {} attempts",
            tx_hash, self.settings.max_chain_attempts
        );
        fail(record, observer, FailureKind::Timeout, reason);
        record.status
    }

    async fn fetch(
        &self,
        tx_hash: H256,
    ) -> Result<Option<(TransactionReceipt, Transaction)>, crate::error::ChainQueryError> {
        let (receipt, tx) = tokio::try_join!(
            self.client.transaction_receipt(tx_hash),
            self.client.transaction(tx_hash)
        )?;
        Ok(receipt.zip(tx))
    }

    async fn classify(
        &self,
        receipt: &TransactionReceipt,
        tx: &Transaction,
        record: &mut OperationRecord,
        observer: &dyn StatusObserver,
    ) {
        // The bundle can succeed while the operation inside it reverted.
        let aa = EntryPointLogs::parse(&receipt.logs, record.hash.0);
        if let Some(bytes) = aa.revert_reason() {
            let kind = if aa.post_op_revert.is_some() {
                FailureKind::PostOpRevert
            } else {
                FailureKind::UserOperationRevert
            };
            fail(record, observer, kind, revert::decode(Some(bytes)));
            return;
        }
        if aa.user_operation.as_ref().is_some_and(|e| !e.success) {
            fail(
                record,
                observer,
                FailureKind::UserOperationRevert,
                "UserOperation reverted without a revert reason",
            );
            return;
        }

        if receipt.status == Some(0u64.into()) {
            let reason = match self.client.revert_data(tx).await {
                Ok(Some(data)) if !data.is_empty() => {
                    format!("Transaction reverted on-chain: {}", revert::decode(Some(&data[..])))
                }
                Ok(_) => "Transaction reverted on-chain. Check gas limits and account balance."
                    .to_string(),
                Err(err) => {
                    debug!("Could not replay {:?}: {}", tx.hash, err);
                    "Transaction failed on-chain (status: reverted)".to_string()
                }
            };
            fail(record, observer, FailureKind::OnChainRevert, reason);
            return;
        }

        if has_expected_event(&record.kind, &receipt.logs) {
            info!("Transaction {:?} emitted the expected event", receipt.transaction_hash);
            if record.succeed() {
                observer.on_status_change(record.hash, record.status);
            }
            return;
        }

        let report = self.diagnose(&record.kind, receipt, tx).await;
        fail(record, observer, FailureKind::SemanticFailure, report);
    }

    /// Explains why a formally successful transaction left no expected event.
    async fn diagnose(
        &self,
        kind: &OperationKind,
        receipt: &TransactionReceipt,
        tx: &Transaction,
    ) -> String {
        let mut report = format!(
            "Transaction succeeded but no {} event was emitted.\n",
            kind.expected_event()
        );

        if let Some(target) = kind.target() {
            match self.client.code_at(target).await {
                Ok(code) if code.is_empty() => {
                    let _ = writeln!(report, "- No contract code found at {target:?}");
                }
                Ok(_) => {
                    let _ = writeln!(report, "- Contract exists at {target:?}");
                }
                Err(err) => {
                    let _ = writeln!(report, "- Could not fetch code at {target:?}: {err}");
                }
            }
        }

        if receipt.logs.is_empty() {
            report.push_str("- No events were emitted by this transaction\n");
        } else {
            let _ = writeln!(report, "- Transaction emitted {} events", receipt.logs.len());
            if let Some(target) = kind.target() {
                describe_target_logs(&mut report, kind, target, &receipt.logs);
            }
        }

        if let Some(percent) = gas_used_percent(receipt, tx) {
            if percent > self.settings.gas_warning_percent {
                let _ = writeln!(
                    report,
                    "- Transaction used {percent}% of its gas limit and may have run out of gas"
                );
            }
        }

        report.trim_end().to_string()
    }
}

fn describe_target_logs(report: &mut String, kind: &OperationKind, target: Address, logs: &[Log]) {
    let target_logs: Vec<&Log> = logs.iter().filter(|l| l.address == target).collect();
    if target_logs.is_empty() {
        let emitters: BTreeSet<Address> = logs.iter().map(|l| l.address).collect();
        let listed: Vec<String> = emitters
            .iter()
            .take(MAX_LISTED_EMITTERS)
            .map(|a| format!("{a:?}"))
            .collect();
        let _ = writeln!(
            report,
            "- No events from {target:?}; events were emitted by: {}",
            listed.join(", ")
        );
        return;
    }

    let _ = writeln!(report, "- Found {} events from {target:?}", target_logs.len());
    if matches!(kind, OperationKind::Transfer { .. }) {
        let approvals = target_logs
            .iter()
            .filter(|l| is_event::<ApprovalFilter>(l))
            .count();
        if approvals > 0 {
            let _ = writeln!(
                report,
                "- Found {approvals} Approval events instead of Transfer; this looks like an approval, not a transfer"
            );
        }
    }
}

fn gas_used_percent(receipt: &TransactionReceipt, tx: &Transaction) -> Option<u64> {
    let used = receipt.gas_used?;
    if tx.gas.is_zero() {
        return None;
    }
    let percent = used.checked_mul(U256::from(100u64))? / tx.gas;
    Some(percent.min(U256::from(u64::MAX)).as_u64())
}

fn has_expected_event(kind: &OperationKind, logs: &[Log]) -> bool {
    match kind {
        OperationKind::Transfer { token } => logs
            .iter()
            .any(|l| l.address == *token && is_event::<TransferFilter>(l)),
        OperationKind::Approval { token } => logs
            .iter()
            .any(|l| l.address == *token && is_event::<ApprovalFilter>(l)),
        OperationKind::Counter { contract } => logs.iter().any(|l| {
            l.address == *contract
                && (is_event::<IncrementFilter>(l) || is_event::<DecrementFilter>(l))
        }),
        OperationKind::Generic => true,
    }
}

pub(crate) fn fail(
    record: &mut OperationRecord,
    observer: &dyn StatusObserver,
    kind: FailureKind,
    reason: impl Into<String>,
) {
    if record.fail(kind, reason) {
        if let Some(reason) = &record.failure_reason {
            debug!("Operation {:?} failed ({:?}): {}", record.hash, kind, reason);
            observer.on_failure_reason(record.hash, reason);
        }
        observer.on_failure_kind(record.hash, kind);
        observer.on_status_change(record.hash, record.status);
    }
}
