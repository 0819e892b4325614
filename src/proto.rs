//! Versioned wire and storage schemas (`raftlite.v1`).
//!
//! Messages are declared directly as prost structs so the encoding is owned
//! by this crate and does not depend on a transport. The tonic service stubs
//! for these messages are generated by `build.rs`.

/// Version stamped into every persisted state blob.
pub const STATE_VERSION: u32 = 1;

/// A single replicated log entry. `command` is opaque to the consensus core.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub command: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteArgs {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub candidate_id: u64,
    #[prost(uint64, tag = "3")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_log_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteReply {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesArgs {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub leader_id: u64,
    #[prost(uint64, tag = "3")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub prev_log_term: u64,
    #[prost(message, repeated, tag = "5")]
    pub entries: Vec<LogEntry>,
    #[prost(uint64, tag = "6")]
    pub leader_commit: u64,
}

/// Reply to AppendEntries. On failure `conflict_index`/`conflict_term` let the
/// leader skip back over a whole term instead of one entry at a time.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesReply {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(uint64, tag = "3")]
    pub conflict_index: u64,
    /// 0 when the follower had no entry at `prev_log_index`.
    #[prost(uint64, tag = "4")]
    pub conflict_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub command: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitReply {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(bool, tag = "3")]
    pub is_leader: bool,
    #[prost(uint64, optional, tag = "4")]
    pub leader_id: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusReply {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(bool, tag = "3")]
    pub is_leader: bool,
    #[prost(uint64, optional, tag = "4")]
    pub leader_id: Option<u64>,
    #[prost(uint64, tag = "5")]
    pub commit_index: u64,
    #[prost(uint64, tag = "6")]
    pub last_applied: u64,
    #[prost(uint64, tag = "7")]
    pub last_log_index: u64,
}

/// Durable state blob: term, vote and log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PersistentState {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint64, tag = "2")]
    pub current_term: u64,
    #[prost(uint64, optional, tag = "3")]
    pub voted_for: Option<u64>,
    #[prost(message, repeated, tag = "4")]
    pub entries: Vec<LogEntry>,
}

include!(concat!(env!("OUT_DIR"), "/raftlite.v1.RaftService.rs"));
include!(concat!(env!("OUT_DIR"), "/raftlite.v1.ClientService.rs"));
