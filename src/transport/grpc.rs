use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::transport::Transport;

/// tonic-backed transport. Channels are created lazily, so unreachable peers
/// do not fail startup and are retried on every call.
pub struct GrpcTransport {
    peers: HashMap<u64, RaftServiceClient<Channel>>,
}

impl GrpcTransport {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let mut peers = HashMap::new();
        for peer_config in &config.peers {
            let addr = format!("http://{}", peer_config.addr);
            let endpoint = Endpoint::from_shared(addr.clone())
                .map_err(|e| RaftError::Config(format!("invalid peer address {addr}: {e}")))?
                .connect_timeout(Duration::from_millis(config.rpc_timeout_ms.max(1)))
                .timeout(config.rpc_timeout());
            tracing::info!(peer_id = peer_config.node_id, addr = %addr, "Configured peer");
            peers.insert(
                peer_config.node_id,
                RaftServiceClient::new(endpoint.connect_lazy()),
            );
        }
        Ok(Self { peers })
    }

    fn client(&self, peer_id: u64) -> Result<RaftServiceClient<Channel>> {
        self.peers
            .get(&peer_id)
            .cloned()
            .ok_or(RaftError::UnknownPeer(peer_id))
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn request_vote(&self, peer_id: u64, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let mut client = self.client(peer_id)?;
        let response = client.request_vote(args).await?;
        Ok(response.into_inner())
    }

    async fn append_entries(
        &self,
        peer_id: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let mut client = self.client(peer_id)?;
        let response = client.append_entries(args).await?;
        Ok(response.into_inner())
    }
}
