//! Transport boundary between consensus nodes.
//!
//! The core only needs two request/reply calls addressed by peer id. Delivery
//! may drop, delay, duplicate or reorder messages; callers bound every call
//! with their own timeout.

pub mod grpc;
pub mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::proto::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

pub use grpc::GrpcTransport;
pub use local::{LocalNetwork, LocalTransport};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, peer_id: u64, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    async fn append_entries(
        &self,
        peer_id: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply>;
}
