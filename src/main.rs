use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use raft_lite::config::{NodeConfig, PeerConfig};
use raft_lite::error::RaftError;
use raft_lite::grpc::GrpcServer;
use raft_lite::proto::client_service_client::ClientServiceClient;
use raft_lite::proto::{StatusRequest, SubmitRequest};
use raft_lite::raft::{FilePersister, MemoryPersister, Persister, RaftNode};
use raft_lite::shutdown::install_shutdown_handler;
use raft_lite::transport::GrpcTransport;

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "A small Raft consensus node with a replicated command log")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a raft-lite server node
    Server(ServerArgs),

    /// Submit a command to the replicated log
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// The command payload (stored as UTF-8 bytes)
        command: String,
    },

    /// Show the status of one node
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for durable raft state. Without it, state lives in memory only.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Interval between leader heartbeats
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Per-RPC deadline for peer requests
    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    accepted: bool,
    index: u64,
    term: u64,
    leader_id: Option<u64>,
}

#[derive(Serialize)]
struct StatusOutput {
    node_id: u64,
    term: u64,
    is_leader: bool,
    leader_id: Option<u64>,
    commit_index: u64,
    last_applied: u64,
    last_log_index: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_peers(peers_str: &str) -> Result<Vec<PeerConfig>, RaftError> {
    if peers_str.trim().is_empty() {
        return Ok(Vec::new());
    }

    // A dropped entry would shrink the quorum, so any bad entry is fatal
    peers_str
        .split(',')
        .map(|peer| {
            let peer = peer.trim();
            let parts: Vec<&str> = peer.split(':').collect();
            if parts.len() != 3 || parts[1].is_empty() || parts[2].is_empty() {
                return Err(RaftError::Config(format!(
                    "invalid peer '{}', expected id:host:port",
                    peer
                )));
            }
            let node_id: u64 = parts[0]
                .parse()
                .map_err(|_| RaftError::Config(format!("invalid peer id in '{}'", peer)))?;
            let _port: u16 = parts[2]
                .parse()
                .map_err(|_| RaftError::Config(format!("invalid peer port in '{}'", peer)))?;
            Ok(PeerConfig {
                node_id,
                addr: format!("{}:{}", parts[1], parts[2]),
            })
        })
        .collect()
}

async fn create_client(addr: &str) -> Result<ClientServiceClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(addr.to_string())?.connect().await?;
    Ok(ClientServiceClient::new(channel))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        peers: parse_peers(&args.peers)?,
        election_timeout_min_ms: args.election_timeout_min_ms,
        election_timeout_max_ms: args.election_timeout_max_ms,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        rpc_timeout_ms: args.rpc_timeout_ms,
        data_dir: args.data_dir,
    };
    config.validate()?;

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        data_dir = ?config.data_dir,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting raft-lite node"
    );

    let persister: Arc<dyn Persister> = match &config.data_dir {
        Some(dir) => Arc::new(FilePersister::new(dir)?),
        None => {
            tracing::warn!("No --data-dir given, raft state will not survive a restart");
            Arc::new(MemoryPersister::new())
        }
    };
    let transport = Arc::new(GrpcTransport::new(&config)?);
    let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();

    let shutdown = install_shutdown_handler()?;
    let node = RaftNode::start(config, transport, persister, apply_tx)?;

    // The log is the product here: report each committed command as it applies
    let node_id = node.id;
    tokio::spawn(async move {
        while let Some(msg) = apply_rx.recv().await {
            tracing::info!(
                node_id,
                index = msg.index,
                term = msg.term,
                command = %String::from_utf8_lossy(&msg.command),
                "Applied entry"
            );
        }
    });

    // A halted node takes the server down with it
    let node_stopped = node.shutdown_token();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        node_stopped.cancelled().await;
        server_shutdown.cancel();
    });

    let server = GrpcServer::new(listen_addr, node.clone());
    let result = server.run(shutdown).await;
    node.shutdown();
    result?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_submit(
    client: &mut ClientServiceClient<Channel>,
    command: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = client
        .submit(SubmitRequest {
            command: command.into_bytes(),
        })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = SubmitOutput {
                accepted: resp.is_leader,
                index: resp.index,
                term: resp.term,
                leader_id: resp.leader_id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if resp.is_leader {
                println!("Command accepted");
                println!("Index: {}", resp.index);
                println!("Term:  {}", resp.term);
            } else {
                match resp.leader_id {
                    Some(leader_id) => {
                        eprintln!("Not the leader; last known leader is node {}", leader_id)
                    }
                    None => eprintln!("Not the leader; no leader known yet"),
                }
            }
        }
    }

    Ok(())
}

async fn handle_status(
    client: &mut ClientServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = client.status(StatusRequest {}).await?.into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                node_id: resp.node_id,
                term: resp.term,
                is_leader: resp.is_leader,
                leader_id: resp.leader_id,
                commit_index: resp.commit_index,
                last_applied: resp.last_applied,
                last_log_index: resp.last_log_index,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            let leader = resp
                .leader_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("Node:           {}", resp.node_id);
            println!(
                "Role:           {}",
                if resp.is_leader { "leader" } else { "not leader" }
            );
            println!("Term:           {}", resp.term);
            println!("Leader:         {}", leader);
            println!("Last log index: {}", resp.last_log_index);
            println!("Commit index:   {}", resp.commit_index);
            println!("Last applied:   {}", resp.last_applied);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Submit { client, command } => {
            let mut grpc_client = create_client(&client.addr).await?;
            handle_submit(&mut grpc_client, command, &client.output).await?;
        }
        Commands::Status { client } => {
            let mut grpc_client = create_client(&client.addr).await?;
            handle_status(&mut grpc_client, &client.output).await?;
        }
    }

    Ok(())
}
