use crate::consensus::RoundState;
use crate::rpc::PoolView;
use crate::types::{SyncInfo, Timeout, Vote};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;

/// HTTP client for a node's `bft_*` diagnostics.
pub struct BftClient {
    client: HttpClient,
}

impl BftClient {
    pub fn new(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let client = HttpClientBuilder::default().build(url)?;
        Ok(Self { client })
    }

    pub async fn round_state(&self) -> Result<RoundState, Box<dyn std::error::Error>> {
        let state: RoundState = self
            .client
            .request("bft_roundState", rpc_params![])
            .await?;
        Ok(state)
    }

    pub async fn sync_info(&self) -> Result<SyncInfo, Box<dyn std::error::Error>> {
        let sync_info: SyncInfo = self.client.request("bft_syncInfo", rpc_params![]).await?;
        Ok(sync_info)
    }

    pub async fn received_timeouts(&self) -> Result<PoolView<Timeout>, Box<dyn std::error::Error>> {
        let pool: PoolView<Timeout> = self
            .client
            .request("bft_receivedTimeouts", rpc_params![])
            .await?;
        Ok(pool)
    }

    pub async fn received_votes(&self) -> Result<PoolView<Vote>, Box<dyn std::error::Error>> {
        let pool: PoolView<Vote> = self
            .client
            .request("bft_receivedVotes", rpc_params![])
            .await?;
        Ok(pool)
    }

    pub async fn received_sync_info(
        &self,
    ) -> Result<PoolView<SyncInfo>, Box<dyn std::error::Error>> {
        let pool: PoolView<SyncInfo> = self
            .client
            .request("bft_receivedSyncInfo", rpc_params![])
            .await?;
        Ok(pool)
    }
}
