// src/rpc.rs
use std::fmt::Display;
use std::sync::Arc;

use ethers::types::{Address, Bytes, H256};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::error::ErrorObjectOwned;
use jsonrpsee::RpcModule;
use tracing::{debug, error, info};

use crate::bundler::BundlerClient;
use crate::chain::ChainClient;
use crate::paymaster::{GasSponsor, PaymasterClient};
use crate::revert::{decode_structured, DecodedRevert};
use crate::tracker::OperationTracker;
use crate::types::{OperationKind, OperationRecord, UserOperation};

const SERVER_ERROR: i32 = -32000;

fn rpc_error(err: impl Display) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(SERVER_ERROR, err.to_string(), None::<()>)
}

#[rpc(server, namespace = "pm")]
pub trait PaymasterRelayApi {
    /// Fills, validates and sponsors a draft operation through the upstream
    /// paymaster.
    #[method(name = "sponsorUserOperation")]
    async fn sponsor(
        &self,
        user_op: UserOperation,
        entry_point: Option<Address>,
    ) -> RpcResult<UserOperation>;
}

#[rpc(server, namespace = "aa")]
pub trait StatusApi {
    #[method(name = "trackUserOperation")]
    async fn track(&self, hash: H256, kind: Option<OperationKind>) -> RpcResult<OperationRecord>;

    #[method(name = "getOperationStatus")]
    async fn status(&self, hash: H256) -> RpcResult<Option<OperationRecord>>;

    #[method(name = "cancelTracking")]
    async fn cancel_tracking(&self, hash: H256) -> RpcResult<bool>;

    #[method(name = "decodeRevertReason")]
    async fn decode_revert_reason(&self, data: Bytes) -> RpcResult<DecodedRevert>;
}

pub struct PaymasterRelay<P> {
    sponsor: Arc<GasSponsor<P>>,
}

impl<P> PaymasterRelay<P> {
    pub fn new(sponsor: Arc<GasSponsor<P>>) -> Self {
        Self { sponsor }
    }
}

#[async_trait]
impl<P: PaymasterClient + 'static> PaymasterRelayApiServer for PaymasterRelay<P> {
    async fn sponsor(
        &self,
        user_op: UserOperation,
        entry_point: Option<Address>,
    ) -> RpcResult<UserOperation> {
        debug!("Received sponsor request for sender: {:?}", user_op.sender);
        let entry_point = entry_point.unwrap_or_else(|| self.sponsor.entry_point());
        let sender = user_op.sender;

        match self.sponsor.sponsor_for(user_op, entry_point).await {
            Ok(sponsored) => {
                info!("Successfully sponsored operation for {:?}", sender);
                Ok(sponsored)
            }
            Err(e) => {
                error!("Failed to sponsor operation: {}", e);
                Err(rpc_error(e))
            }
        }
    }
}

pub struct StatusService<B, C> {
    tracker: Arc<OperationTracker<B, C>>,
}

impl<B, C> StatusService<B, C> {
    pub fn new(tracker: Arc<OperationTracker<B, C>>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl<B, C> StatusApiServer for StatusService<B, C>
where
    B: BundlerClient + 'static,
    C: ChainClient + 'static,
{
    async fn track(&self, hash: H256, kind: Option<OperationKind>) -> RpcResult<OperationRecord> {
        Ok(self.tracker.track(hash, kind.unwrap_or_default()))
    }

    async fn status(&self, hash: H256) -> RpcResult<Option<OperationRecord>> {
        Ok(self.tracker.status(hash))
    }

    async fn cancel_tracking(&self, hash: H256) -> RpcResult<bool> {
        Ok(self.tracker.cancel(hash))
    }

    async fn decode_revert_reason(&self, data: Bytes) -> RpcResult<DecodedRevert> {
        Ok(decode_structured(Some(&data[..])))
    }
}

/// Both namespaces in one module, ready for the server.
pub fn build_module<P, B, C>(
    relay: PaymasterRelay<P>,
    status: StatusService<B, C>,
) -> anyhow::Result<RpcModule<()>>
where
    P: PaymasterClient + 'static,
    B: BundlerClient + 'static,
    C: ChainClient + 'static,
{
    let mut module = RpcModule::new(());
    module.merge(relay.into_rpc())?;
    module.merge(status.into_rpc())?;
    Ok(module)
}
