// src/config.rs
use std::time::Duration;

use ethers::types::{Address, Bytes, U256};

use crate::types::SponsorshipResult;

/// Canonical ERC-4337 v0.7 EntryPoint.
pub const DEFAULT_ENTRY_POINT: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

/// Bounds for the two polling loops.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Delay between bundler receipt lookups.
    pub bundler_interval: Duration,
    /// Bundler lookups before falling back to the chain.
    pub max_bundler_attempts: u32,
    /// Wait before the first chain lookup.
    pub chain_initial_delay: Duration,
    pub chain_retry_interval: Duration,
    pub max_chain_attempts: u32,
    /// Gas usage (percent of the limit) above which a silent out-of-gas is suspected.
    pub gas_warning_percent: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            bundler_interval: Duration::from_millis(1500),
            max_bundler_attempts: 10,
            chain_initial_delay: Duration::from_secs(2),
            chain_retry_interval: Duration::from_secs(5),
            max_chain_attempts: 6,
            gas_warning_percent: 95,
        }
    }
}

/// Values used to fill an operation draft before it is sent for sponsorship.
#[derive(Debug, Clone)]
pub struct GasDefaults {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
    /// Paymaster advertised in stub data, before the real sponsorship call.
    pub stub_paymaster: Option<Address>,
}

impl Default for GasDefaults {
    fn default() -> Self {
        Self {
            call_gas_limit: U256::from(400_000u64),
            verification_gas_limit: U256::from(300_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_fee_per_gas: U256::from(0x7A5C_F70D5u64),
            max_priority_fee_per_gas: U256::from(0x3B9A_CA00u64),
            paymaster_verification_gas_limit: U256::from(300_000u64),
            paymaster_post_op_gas_limit: U256::from(100u64),
            stub_paymaster: None,
        }
    }
}

impl GasDefaults {
    /// Placeholder paymaster fields used for gas estimation.
    pub fn stub_data(&self) -> SponsorshipResult {
        SponsorshipResult {
            paymaster: self.stub_paymaster,
            paymaster_data: self.stub_paymaster.map(|_| Bytes::default()),
            pre_verification_gas: Some(self.pre_verification_gas),
            verification_gas_limit: Some(self.verification_gas_limit),
            call_gas_limit: Some(self.call_gas_limit),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            paymaster_verification_gas_limit: Some(self.paymaster_verification_gas_limit),
            paymaster_post_op_gas_limit: Some(self.paymaster_post_op_gas_limit),
        }
    }
}
