// src/chain.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Middleware, MiddlewareError};
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Transaction, TransactionReceipt, TransactionRequest, H256,
};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::error::ChainQueryError;

/// The chain reads the status checker needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainQueryError>;

    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>, ChainQueryError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainQueryError>;

    /// Re-runs `tx` as a call just before its block and returns the revert
    /// payload the node reports, if any.
    async fn revert_data(&self, tx: &Transaction) -> Result<Option<Bytes>, ChainQueryError>;
}

/// [`ChainClient`] over any ethers middleware stack.
#[derive(Debug)]
pub struct EthChainClient<M> {
    provider: Arc<M>,
}

impl<M> EthChainClient<M> {
    pub fn new(provider: Arc<M>) -> Self {
        Self { provider }
    }
}

fn query_error<E: std::fmt::Display>(err: E) -> ChainQueryError {
    ChainQueryError(err.to_string())
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthChainClient<M> {
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainQueryError> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(query_error)
    }

    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>, ChainQueryError> {
        self.provider.get_transaction(hash).await.map_err(query_error)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainQueryError> {
        self.provider
            .get_code(address, None)
            .await
            .map_err(query_error)
    }

    async fn revert_data(&self, tx: &Transaction) -> Result<Option<Bytes>, ChainQueryError> {
        let mut request = TransactionRequest::new()
            .from(tx.from)
            .data(tx.input.clone())
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            request = request.to(to);
        }
        let block = tx
            .block_number
            .map(|n| BlockId::Number(BlockNumber::Number(n.saturating_sub(1u64.into()))));

        match self.provider.call(&request.into(), block).await {
            Ok(_) => Ok(None),
            Err(err) => match err.as_error_response() {
                Some(resp) => {
                    debug!("Replay of {:?} reverted: {}", tx.hash, resp.message);
                    Ok(resp.as_revert_data())
                }
                None => Err(query_error(err)),
            },
        }
    }
}
