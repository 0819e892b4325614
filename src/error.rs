use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Failed to decode persisted state: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer {0} is unreachable")]
    Unreachable(u64),

    #[error("RPC to peer {0} timed out")]
    Timeout(u64),

    #[error("Unknown peer: {0}")]
    UnknownPeer(u64),

    #[error("Node is stopped")]
    Stopped,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;

impl From<RaftError> for tonic::Status {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader(_) => tonic::Status::failed_precondition(err.to_string()),
            RaftError::Stopped => tonic::Status::unavailable(err.to_string()),
            RaftError::Grpc(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
