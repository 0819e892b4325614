use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::proto::client_service_server::ClientService as ClientServiceApi;
use crate::proto::{StatusReply, StatusRequest, SubmitReply, SubmitRequest};
use crate::raft::RaftNode;

/// gRPC service for client-facing API
pub struct ClientService {
    raft_node: Arc<RaftNode>,
}

impl ClientService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

#[tonic::async_trait]
impl ClientServiceApi for ClientService {
    /// Submit a command. Non-leaders answer with `is_leader = false` and their
    /// best guess of the leader instead of an error, so clients can redirect.
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitReply>, Status> {
        let req = request.into_inner();

        match self.raft_node.submit(req.command).await {
            Ok((index, term)) => {
                tracing::debug!(index, term, "Accepted client command");
                Ok(Response::new(SubmitReply {
                    index,
                    term,
                    is_leader: true,
                    leader_id: Some(self.raft_node.id),
                }))
            }
            Err(RaftError::NotLeader(leader_id)) => {
                let (term, _) = self.raft_node.get_state().await;
                Ok(Response::new(SubmitReply {
                    index: 0,
                    term,
                    is_leader: false,
                    leader_id,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        Ok(Response::new(self.raft_node.status().await))
    }
}
