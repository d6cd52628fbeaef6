// src/bundler.rs
use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::{Address, H256};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::error::BundlerError;
use crate::types::{UserOperation, UserOperationReceipt};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundlerClient: Send + Sync {
    /// `Ok(None)` while the bundler has no receipt for `hash`.
    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<UserOperationReceipt>, BundlerError>;

    async fn send_user_operation(
        &self,
        user_op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, BundlerError>;
}

/// Bundler reached over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct HttpBundler {
    provider: Provider<Http>,
}

impl HttpBundler {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(url)?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl BundlerClient for HttpBundler {
    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<UserOperationReceipt>, BundlerError> {
        let receipt: Option<UserOperationReceipt> = self
            .provider
            .request("eth_getUserOperationReceipt", [hash])
            .await?;
        debug!("Bundler receipt for {:?} present: {}", hash, receipt.is_some());
        Ok(receipt)
    }

    async fn send_user_operation(
        &self,
        user_op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, BundlerError> {
        let hash: H256 = self
            .provider
            .request("eth_sendUserOperation", (user_op, entry_point))
            .await?;
        info!("Bundler accepted operation from {:?}: {:?}", user_op.sender, hash);
        Ok(hash)
    }
}
