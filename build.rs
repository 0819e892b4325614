use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    // Peer-to-peer consensus RPCs
    let raft_service = Service::builder()
        .name("RaftService")
        .package("raftlite.v1")
        .method(method(
            "request_vote",
            "RequestVote",
            "RequestVoteArgs",
            "RequestVoteReply",
        ))
        .method(method(
            "append_entries",
            "AppendEntries",
            "AppendEntriesArgs",
            "AppendEntriesReply",
        ))
        .build();

    // Application-facing RPCs
    let client_service = Service::builder()
        .name("ClientService")
        .package("raftlite.v1")
        .method(method("submit", "Submit", "SubmitRequest", "SubmitReply"))
        .method(method("status", "Status", "StatusRequest", "StatusReply"))
        .build();

    Builder::new().compile(&[raft_service, client_service]);
}
