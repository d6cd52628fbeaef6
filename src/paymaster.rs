// src/paymaster.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::{Address, U256};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::GasDefaults;
use crate::error::PaymasterError;
use crate::serializer::{paymaster_params, serialize};
use crate::sponsorship::normalize;
use crate::types::{SponsorshipResult, UserOperation};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymasterClient: Send + Sync {
    async fn sponsor_user_operation(
        &self,
        user_op: &UserOperation,
        entry_point: Address,
    ) -> Result<SponsorshipResult, PaymasterError>;
}

/// Paymaster backend reached over HTTP JSON-RPC, speaking its bespoke
/// integer and byte encoding.
#[derive(Debug, Clone)]
pub struct HttpPaymaster {
    provider: Provider<Http>,
}

impl HttpPaymaster {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(url)?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl PaymasterClient for HttpPaymaster {
    async fn sponsor_user_operation(
        &self,
        user_op: &UserOperation,
        entry_point: Address,
    ) -> Result<SponsorshipResult, PaymasterError> {
        let params = paymaster_params(&serialize(user_op))?;
        debug!("Requesting sponsorship for sender: {:?}", user_op.sender);

        let response: Value = self
            .provider
            .request("pm_sponsorUserOperation", (params, entry_point))
            .await?;
        Ok(normalize(&response))
    }
}

/// Turns an operation draft into a sponsored operation: stub paymaster
/// fields first, then gas defaults, then the real sponsorship round trip.
pub struct GasSponsor<P> {
    client: Arc<P>,
    entry_point: Address,
    defaults: GasDefaults,
}

impl<P: PaymasterClient> GasSponsor<P> {
    pub fn new(client: Arc<P>, entry_point: Address, defaults: GasDefaults) -> Self {
        Self {
            client,
            entry_point,
            defaults,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    /// Paymaster placeholders good enough for gas estimation.
    pub fn stub_data(&self) -> SponsorshipResult {
        self.defaults.stub_data()
    }

    pub async fn sponsor(&self, draft: UserOperation) -> Result<UserOperation, PaymasterError> {
        self.sponsor_for(draft, self.entry_point).await
    }

    pub async fn sponsor_for(
        &self,
        draft: UserOperation,
        entry_point: Address,
    ) -> Result<UserOperation, PaymasterError> {
        let mut user_op = self.prepare(draft);
        validate_user_operation(&user_op)?;
        let max_cost = calculate_max_cost(&user_op)?;
        debug!(
            "Operation from {:?} may cost up to {} wei",
            user_op.sender, max_cost
        );

        let sponsorship = self
            .client
            .sponsor_user_operation(&user_op, entry_point)
            .await?;
        sponsorship.apply_to(&mut user_op);
        info!(
            "Sponsored operation for {:?} via paymaster {:?}",
            user_op.sender, user_op.paymaster
        );
        Ok(user_op)
    }

    /// Merges stub data and fills zero-valued gas and fee fields. Values the
    /// caller already set are kept.
    fn prepare(&self, mut user_op: UserOperation) -> UserOperation {
        let stub = self.stub_data();
        if user_op.paymaster.is_none() {
            user_op.paymaster = stub.paymaster;
            user_op.paymaster_data = stub.paymaster_data;
        }
        if user_op.paymaster_verification_gas_limit.is_none() {
            user_op.paymaster_verification_gas_limit = stub.paymaster_verification_gas_limit;
        }
        if user_op.paymaster_post_op_gas_limit.is_none() {
            user_op.paymaster_post_op_gas_limit = stub.paymaster_post_op_gas_limit;
        }

        let d = &self.defaults;
        fill_zero(&mut user_op.call_gas_limit, d.call_gas_limit);
        fill_zero(&mut user_op.verification_gas_limit, d.verification_gas_limit);
        fill_zero(&mut user_op.pre_verification_gas, d.pre_verification_gas);
        fill_zero(&mut user_op.max_fee_per_gas, d.max_fee_per_gas);
        fill_zero(&mut user_op.max_priority_fee_per_gas, d.max_priority_fee_per_gas);
        user_op
    }
}

fn fill_zero(field: &mut U256, default: U256) {
    if field.is_zero() {
        *field = default;
    }
}

fn validate_user_operation(user_op: &UserOperation) -> Result<(), PaymasterError> {
    if user_op.sender.is_zero() {
        return Err(PaymasterError::InvalidUserOperation(
            "Sender cannot be the zero address".to_string(),
        ));
    }
    if user_op.max_fee_per_gas.is_zero() || user_op.max_priority_fee_per_gas.is_zero() {
        return Err(PaymasterError::InvalidUserOperation(
            "Gas price cannot be zero".to_string(),
        ));
    }
    if user_op.max_priority_fee_per_gas > user_op.max_fee_per_gas {
        return Err(PaymasterError::InvalidUserOperation(
            "Priority fee cannot exceed max fee".to_string(),
        ));
    }
    Ok(())
}

fn calculate_max_cost(user_op: &UserOperation) -> Result<U256, PaymasterError> {
    user_op
        .total_gas()
        .and_then(|gas| gas.checked_mul(user_op.max_fee_per_gas))
        .ok_or_else(|| {
            PaymasterError::InvalidUserOperation("Max cost calculation overflow".to_string())
        })
}
