pub mod config;
pub mod error;
pub mod grpc;
pub mod proto;
pub mod raft;
pub mod shutdown;
pub mod transport;

pub use config::{NodeConfig, PeerConfig};
pub use error::{RaftError, Result};
pub use raft::{ApplyMsg, RaftNode};
