use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use crate::error::{RaftError, Result};
use crate::proto::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::raft::RaftNode;
use crate::transport::Transport;

/// Percentage of requests (and, separately, replies) lost in unreliable mode.
const UNRELIABLE_DROP_PERCENT: u32 = 10;
/// Upper bound on the random delivery delay in unreliable mode.
const UNRELIABLE_MAX_DELAY_MS: u64 = 27;

/// In-process network connecting [`RaftNode`]s by id.
///
/// Links can be cut per node or per pair, and the whole network can be made
/// unreliable (random loss and delay). Used by the integration tests and for
/// running a cluster inside one process.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<u64, Arc<RaftNode>>>,
    isolated: RwLock<HashSet<u64>>,
    blocked_links: RwLock<HashSet<(u64, u64)>>,
    unreliable: AtomicBool,
    rpc_count: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport handle for the node with id `node_id`.
    pub fn transport(self: &Arc<Self>, node_id: u64) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            node_id,
        })
    }

    pub async fn register(&self, node: Arc<RaftNode>) {
        self.nodes.write().await.insert(node.id, node);
    }

    /// Remove a node from the network (simulates a crash from the peers' view).
    pub async fn unregister(&self, node_id: u64) -> Option<Arc<RaftNode>> {
        self.nodes.write().await.remove(&node_id)
    }

    /// Cut a node off from every other node.
    pub async fn disconnect(&self, node_id: u64) {
        self.isolated.write().await.insert(node_id);
    }

    pub async fn reconnect(&self, node_id: u64) {
        self.isolated.write().await.remove(&node_id);
    }

    /// Block traffic in both directions between every node of `a` and every node of `b`.
    pub async fn partition(&self, a: &[u64], b: &[u64]) {
        let mut blocked = self.blocked_links.write().await;
        for &x in a {
            for &y in b {
                blocked.insert((x, y));
                blocked.insert((y, x));
            }
        }
    }

    /// Remove every blocked link and isolation.
    pub async fn heal(&self) {
        self.blocked_links.write().await.clear();
        self.isolated.write().await.clear();
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.unreliable.store(unreliable, Ordering::SeqCst);
    }

    /// Number of RPCs attempted through this network.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    async fn connected(&self, from: u64, to: u64) -> bool {
        let isolated = self.isolated.read().await;
        if isolated.contains(&from) || isolated.contains(&to) {
            return false;
        }
        !self.blocked_links.read().await.contains(&(from, to))
    }

    /// Resolve the target node, applying loss, delay and partitions.
    async fn route(&self, from: u64, to: u64) -> Result<Arc<RaftNode>> {
        self.rpc_count.fetch_add(1, Ordering::Relaxed);

        if self.unreliable.load(Ordering::SeqCst) {
            let (delay_ms, drop) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(0..UNRELIABLE_MAX_DELAY_MS),
                    rng.gen_range(0..100) < UNRELIABLE_DROP_PERCENT,
                )
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if drop {
                return Err(RaftError::Unreachable(to));
            }
        }

        if !self.connected(from, to).await {
            return Err(RaftError::Unreachable(to));
        }

        self.nodes
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or(RaftError::Unreachable(to))
    }

    /// Decide whether a reply makes it back to the caller.
    async fn deliver_reply(&self, from: u64, to: u64) -> Result<()> {
        if !self.connected(from, to).await {
            return Err(RaftError::Unreachable(to));
        }
        if self.unreliable.load(Ordering::SeqCst) {
            let drop = rand::thread_rng().gen_range(0..100) < UNRELIABLE_DROP_PERCENT;
            if drop {
                return Err(RaftError::Unreachable(to));
            }
        }
        Ok(())
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    node_id: u64,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, peer_id: u64, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let target = self.network.route(self.node_id, peer_id).await?;
        let reply = target.handle_request_vote(args).await?;
        self.network.deliver_reply(self.node_id, peer_id).await?;
        Ok(reply)
    }

    async fn append_entries(
        &self,
        peer_id: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let target = self.network.route(self.node_id, peer_id).await?;
        let reply = target.handle_append_entries(args).await?;
        self.network.deliver_reply(self.node_id, peer_id).await?;
        Ok(reply)
    }
}
