pub mod log;
pub mod node;
pub mod persist;
pub mod rpc;
pub mod state;
pub mod timer;

pub use log::RaftLog;
pub use node::{ApplyMsg, RaftEvent, RaftNode};
pub use persist::{FilePersister, MemoryPersister, Persister};
pub use state::{RaftRole, RaftState};
