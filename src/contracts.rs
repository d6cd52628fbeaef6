// src/contracts.rs
//! Event and error bindings for the contracts whose logs we inspect.
use ethers::abi::RawLog;
use ethers::contract::{abigen, EthError, EthEvent};
use ethers::types::{Address, Log, U256};

abigen!(
    EntryPoint,
    r#"[
        event UserOperationEvent(bytes32 indexed userOpHash, address indexed sender, address indexed paymaster, uint256 nonce, bool success, uint256 actualGasCost, uint256 actualGasUsed)
        event UserOperationRevertReason(bytes32 indexed userOpHash, address indexed sender, uint256 nonce, bytes revertReason)
        event PostOpRevertReason(bytes32 indexed userOpHash, address indexed sender, uint256 nonce, bytes revertReason)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        event Transfer(address indexed from, address indexed to, uint256 value)
        event Approval(address indexed owner, address indexed spender, uint256 value)
    ]"#
);

abigen!(
    Counter,
    r#"[
        event Increment(address indexed caller, uint256 newValue)
        event Decrement(address indexed caller, uint256 newValue)
    ]"#
);

/// `revert("message")`
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "Error", abi = "Error(string)")]
pub struct RevertString {
    pub reason: String,
}

/// Compiler-inserted checks (overflow, division by zero, ...).
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "Panic", abi = "Panic(uint256)")]
pub struct PanicCode {
    pub code: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(
    name = "ERC20InsufficientBalance",
    abi = "ERC20InsufficientBalance(address,uint256,uint256)"
)]
pub struct Erc20InsufficientBalance {
    pub sender: Address,
    pub balance: U256,
    pub needed: U256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(
    name = "ERC20InsufficientAllowance",
    abi = "ERC20InsufficientAllowance(address,uint256,uint256)"
)]
pub struct Erc20InsufficientAllowance {
    pub spender: Address,
    pub allowance: U256,
    pub needed: U256,
}

/// Decodes `log` as event `E`, or `None` if the topics do not match.
pub fn decode_event<E: EthEvent>(log: &Log) -> Option<E> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    E::decode_log(&raw).ok()
}

pub fn is_event<E: EthEvent>(log: &Log) -> bool {
    log.topics.first() == Some(&E::signature())
}

/// EntryPoint events relevant to one operation, pulled out of a log set.
#[derive(Debug, Clone, Default)]
pub struct EntryPointLogs {
    pub user_operation: Option<UserOperationEventFilter>,
    pub user_operation_revert: Option<UserOperationRevertReasonFilter>,
    pub post_op_revert: Option<PostOpRevertReasonFilter>,
}

impl EntryPointLogs {
    /// Collects the events for `user_op_hash`. A bundle may carry several
    /// operations, so every event must belong to the same operation. When no
    /// event carries the hash (it may be a transaction hash), the operation
    /// of the first `UserOperationEvent` is used instead.
    pub fn parse(logs: &[Log], user_op_hash: [u8; 32]) -> Self {
        let ops: Vec<UserOperationEventFilter> = logs.iter().filter_map(decode_event).collect();
        let reverts: Vec<UserOperationRevertReasonFilter> =
            logs.iter().filter_map(decode_event).collect();
        let post_ops: Vec<PostOpRevertReasonFilter> =
            logs.iter().filter_map(decode_event).collect();

        let known = ops.iter().any(|e| e.user_op_hash == user_op_hash)
            || reverts.iter().any(|e| e.user_op_hash == user_op_hash)
            || post_ops.iter().any(|e| e.user_op_hash == user_op_hash);
        let anchor = if known {
            Some(user_op_hash)
        } else {
            ops.first()
                .map(|e| e.user_op_hash)
                .or_else(|| reverts.first().map(|e| e.user_op_hash))
                .or_else(|| post_ops.first().map(|e| e.user_op_hash))
        };
        let Some(anchor) = anchor else {
            return Self::default();
        };

        Self {
            user_operation: ops.into_iter().find(|e| e.user_op_hash == anchor),
            user_operation_revert: reverts.into_iter().find(|e| e.user_op_hash == anchor),
            post_op_revert: post_ops.into_iter().find(|e| e.user_op_hash == anchor),
        }
    }

    /// Post-op revert data takes precedence over the execution revert.
    pub fn revert_reason(&self) -> Option<&[u8]> {
        self.post_op_revert
            .as_ref()
            .map(|e| -> &[u8] { &e.revert_reason })
            .or_else(|| {
                self.user_operation_revert
                    .as_ref()
                    .map(|e| -> &[u8] { &e.revert_reason })
            })
            .filter(|bytes| !bytes.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.user_operation.is_none()
            && self.user_operation_revert.is_none()
            && self.post_op_revert.is_none()
    }
}
