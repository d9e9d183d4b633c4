use crate::consensus::{BftEngine, RoundState};
use crate::pool::{PoolBucket, PoolObject};
use crate::types::{SyncInfo, Timeout, Vote};
use jsonrpsee::core::{RpcResult, async_trait};
use jsonrpsee::proc_macros::rpc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Pool contents as served over RPC: pool key -> signer -> message.
pub type PoolView<T> = BTreeMap<String, BTreeMap<String, T>>;

/// Every read takes the engine lock, which message handlers hold through
/// signature verification, so methods run on the blocking pool.
#[rpc(server)]
pub trait BftRpc {
    #[method(name = "bft_roundState", blocking)]
    fn round_state(&self) -> RpcResult<RoundState>;

    #[method(name = "bft_syncInfo", blocking)]
    fn sync_info(&self) -> RpcResult<SyncInfo>;

    #[method(name = "bft_receivedTimeouts", blocking)]
    fn received_timeouts(&self) -> RpcResult<PoolView<Timeout>>;

    #[method(name = "bft_receivedVotes", blocking)]
    fn received_votes(&self) -> RpcResult<PoolView<Vote>>;

    #[method(name = "bft_receivedSyncInfo", blocking)]
    fn received_sync_info(&self) -> RpcResult<PoolView<SyncInfo>>;
}

pub struct BftRpcImpl {
    engine: Arc<BftEngine>,
}

impl BftRpcImpl {
    pub fn new(engine: Arc<BftEngine>) -> Self {
        Self { engine }
    }
}

fn pool_view<T: PoolObject>(pool: HashMap<T::Key, PoolBucket<T>>) -> PoolView<T> {
    pool.into_iter()
        .map(|(key, bucket)| {
            let bucket = bucket
                .into_iter()
                .map(|(signer, obj)| (signer.to_string(), obj))
                .collect();
            (key.to_string(), bucket)
        })
        .collect()
}

#[async_trait]
impl BftRpcServer for BftRpcImpl {
    fn round_state(&self) -> RpcResult<RoundState> {
        Ok(self.engine.round_state())
    }

    fn sync_info(&self) -> RpcResult<SyncInfo> {
        Ok(self.engine.build_sync_info())
    }

    fn received_timeouts(&self) -> RpcResult<PoolView<Timeout>> {
        Ok(pool_view(self.engine.received_timeouts()))
    }

    fn received_votes(&self) -> RpcResult<PoolView<Vote>> {
        Ok(pool_view(self.engine.received_votes()))
    }

    fn received_sync_info(&self) -> RpcResult<PoolView<SyncInfo>> {
        Ok(pool_view(self.engine.received_sync_info()))
    }
}
