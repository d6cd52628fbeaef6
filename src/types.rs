// src/types.rs
use ethers::types::{Address, Bytes, Log, H256, U256};
use serde::{Deserialize, Serialize};

/// ERC-4337 v0.7 UserOperation in its unpacked RPC form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    /// Legacy packed deployment code. Never sent to a v0.7 bundler.
    #[serde(default, skip_serializing)]
    pub init_code: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Bytes>,
}

impl UserOperation {
    /// The deployment factory, unless it is unset or the zero address.
    pub fn effective_factory(&self) -> Option<Address> {
        self.factory.filter(|f| !f.is_zero())
    }

    /// `factory ++ factoryData` when both are meaningful, otherwise the
    /// explicitly supplied `init_code` (if non-empty).
    pub fn derived_init_code(&self) -> Option<Bytes> {
        if let Some(code) = self.init_code.as_ref().filter(|c| !c.is_empty()) {
            return Some(code.clone());
        }
        let factory = self.effective_factory()?;
        let data = self.factory_data.as_ref().filter(|d| !d.is_empty())?;
        let mut code = factory.as_bytes().to_vec();
        code.extend_from_slice(data);
        Some(Bytes::from(code))
    }

    /// Sum of every gas budget the EntryPoint may charge for.
    pub fn total_gas(&self) -> Option<U256> {
        [
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.paymaster_verification_gas_limit.unwrap_or_default(),
            self.paymaster_post_op_gas_limit.unwrap_or_default(),
        ]
        .into_iter()
        .try_fold(self.call_gas_limit, |acc, gas| acc.checked_add(gas))
    }
}

/// Gas and paymaster fields returned by a paymaster service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorshipResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_verification_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

impl SponsorshipResult {
    /// Overwrites the fields of `op` that this result carries.
    pub fn apply_to(&self, op: &mut UserOperation) {
        if let Some(paymaster) = self.paymaster {
            op.paymaster = Some(paymaster);
        }
        if let Some(data) = &self.paymaster_data {
            op.paymaster_data = Some(data.clone());
        }
        if let Some(gas) = self.pre_verification_gas {
            op.pre_verification_gas = gas;
        }
        if let Some(gas) = self.verification_gas_limit {
            op.verification_gas_limit = gas;
        }
        if let Some(gas) = self.call_gas_limit {
            op.call_gas_limit = gas;
        }
        if let Some(fee) = self.max_fee_per_gas {
            op.max_fee_per_gas = fee;
        }
        if let Some(fee) = self.max_priority_fee_per_gas {
            op.max_priority_fee_per_gas = fee;
        }
        if let Some(gas) = self.paymaster_verification_gas_limit {
            op.paymaster_verification_gas_limit = Some(gas);
        }
        if let Some(gas) = self.paymaster_post_op_gas_limit {
            op.paymaster_post_op_gas_limit = Some(gas);
        }
    }
}

/// `eth_getUserOperationReceipt` result. Bundlers disagree on the exact
/// shape, so everything is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    #[serde(default)]
    pub user_op_hash: Option<H256>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<H256>,
    #[serde(default)]
    pub receipt: Option<BundledReceipt>,
}

impl UserOperationReceipt {
    pub fn bundled_transaction_hash(&self) -> Option<H256> {
        self.receipt
            .as_ref()
            .and_then(|r| r.transaction_hash)
            .or(self.transaction_hash)
    }

    pub fn logs(&self) -> &[Log] {
        self.receipt.as_ref().map(|r| r.logs.as_slice()).unwrap_or(&[])
    }
}

/// The transaction receipt embedded in a bundler receipt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundledReceipt {
    #[serde(default)]
    pub transaction_hash: Option<H256>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Which layer produced a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Bundler,
    UserOperationRevert,
    PostOpRevert,
    OnChainRevert,
    SemanticFailure,
    Timeout,
}

/// The event a successful operation is expected to leave behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationKind {
    Transfer { token: Address },
    Approval { token: Address },
    Counter { contract: Address },
    #[default]
    Generic,
}

impl OperationKind {
    pub fn target(&self) -> Option<Address> {
        match self {
            Self::Transfer { token } | Self::Approval { token } => Some(*token),
            Self::Counter { contract } => Some(*contract),
            Self::Generic => None,
        }
    }

    pub fn expected_event(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "ERC-20 Transfer",
            Self::Approval { .. } => "ERC-20 Approval",
            Self::Counter { .. } => "Increment/Decrement",
            Self::Generic => "any",
        }
    }
}

/// Per-operation status slot. Once terminal, no transition changes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub hash: H256,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub failure: Option<FailureKind>,
    pub failure_reason: Option<String>,
    pub bundled_tx_hash: Option<H256>,
    pub poll_attempts: u32,
}

impl OperationRecord {
    pub fn new(hash: H256, kind: OperationKind) -> Self {
        Self {
            hash,
            kind,
            status: OperationStatus::Pending,
            failure: None,
            failure_reason: None,
            bundled_tx_hash: None,
            poll_attempts: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns false (and changes nothing) if the record is already settled.
    pub fn succeed(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = OperationStatus::Success;
        self.failure_reason = None;
        true
    }

    /// Returns false (and changes nothing) if the record is already settled.
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let reason = reason.into();
        self.status = OperationStatus::Failed;
        self.failure = Some(kind);
        self.failure_reason = Some(if reason.trim().is_empty() {
            "Operation failed for an unknown reason".to_string()
        } else {
            reason
        });
        true
    }
}
