use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::proto::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, StatusReply,
};
use crate::raft::persist::Persister;
use crate::raft::rpc::{self, next_index_after_conflict};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::ElectionTimer;
use crate::transport::Transport;

/// Events observed by the listener loop that keep the election timer from firing.
#[derive(Debug)]
pub enum RaftEvent {
    /// AppendEntries accepted from the leader of `term`
    HeartbeatReceived { leader_id: u64, term: u64 },
    /// This node granted its vote for `term`
    VoteGranted { candidate_id: u64, term: u64 },
}

/// A committed entry handed to the application, in strictly increasing index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Result of one AppendEntries reply for the replication coordinator.
enum ReplicationStep {
    /// Nothing more to do for this peer until the next round
    Idle,
    /// The peer is behind; send again right away
    Resend,
    /// No longer leader for this term
    Stop,
}

type AppendOutcome = (u64, u64, u64, Result<AppendEntriesReply>);

/// The main Raft node that coordinates consensus
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<Mutex<RaftState>>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    event_tx: mpsc::Sender<RaftEvent>,
    commit_tx: watch::Sender<u64>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    replicate_notify: Notify,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Build a node from persisted state without starting any background work.
    ///
    /// The returned receiver must be passed to [`RaftNode::run`].
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<RaftEvent>)> {
        config.validate()?;
        let state = RaftState::restore(persister)?;
        let (event_tx, event_rx) = mpsc::channel(100);
        let (commit_tx, _) = watch::channel(0);

        tracing::info!(
            node_id = config.node_id,
            term = state.current_term,
            voted_for = ?state.voted_for,
            log_len = state.log.len(),
            "Restored raft state"
        );

        let node = Arc::new(Self {
            id: config.node_id,
            state: Arc::new(Mutex::new(state)),
            config,
            transport,
            event_tx,
            commit_tx,
            apply_tx,
            replicate_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        Ok((node, event_rx))
    }

    /// Build a node and spawn its listener loop and applier. Returns immediately.
    pub fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        let (node, event_rx) = Self::new(config, transport, persister, apply_tx)?;
        tokio::spawn(node.clone().run(event_rx));
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Token cancelled when the node stops, either on request or after a
    /// persistence failure.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop all background tasks. In-flight RPCs are abandoned.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(node_id = self.id, "Shutting down raft node");
        }
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Subscribe to commit index changes
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Run the listener loop until shutdown.
    ///
    /// Waits on heartbeat and vote events, which re-arm the election timer, and
    /// on the timer itself. A timeout while not leader starts a new election,
    /// abandoning any election still in progress.
    pub async fn run(self: Arc<Self>, mut event_rx: mpsc::Receiver<RaftEvent>) {
        let applier = tokio::spawn(self.clone().run_applier());
        let mut timer = ElectionTimer::new(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
        let mut election: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(event) = event_rx.recv() => {
                    match event {
                        RaftEvent::HeartbeatReceived { leader_id, term } => {
                            tracing::trace!(node_id = self.id, leader_id, term, "Heartbeat observed");
                        }
                        RaftEvent::VoteGranted { candidate_id, term } => {
                            tracing::trace!(node_id = self.id, candidate_id, term, "Vote observed");
                        }
                    }
                    timer.reset();
                }

                _ = timer.sleep() => {
                    timer.reset();
                    if self.state.lock().await.role == RaftRole::Leader {
                        continue;
                    }
                    if let Some(previous) = election.take() {
                        previous.abort();
                    }
                    election = Some(tokio::spawn(self.clone().run_election()));
                }
            }
        }

        if let Some(handle) = election {
            handle.abort();
        }
        let _ = applier.await;
        tracing::debug!(node_id = self.id, "Listener loop stopped");
    }

    /// Candidate side: one election round at a fresh term.
    async fn run_election(self: Arc<Self>) {
        let (term, req) = {
            let mut state = self.state.lock().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate(self.id);
            if let Err(e) = state.persist() {
                drop(state);
                self.halt(&e);
                return;
            }
            let req = RequestVoteArgs {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            };
            (state.current_term, req)
        };
        let quorum = self.config.quorum() as u64;

        tracing::info!(node_id = self.id, term, "Starting election");

        // Single-node cluster: the self-vote is already a majority
        if quorum <= 1 {
            let mut state = self.state.lock().await;
            if state.role == RaftRole::Candidate && state.current_term == term {
                self.win_election(&mut state, term);
            }
            return;
        }

        // Request votes from all peers
        let mut requests = JoinSet::new();
        for peer_id in self.config.peer_ids() {
            let transport = self.transport.clone();
            let req = req.clone();
            let rpc_timeout = self.config.rpc_timeout();
            requests.spawn(async move {
                let result = match timeout(rpc_timeout, transport.request_vote(peer_id, req)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(RaftError::Timeout(peer_id)),
                };
                (peer_id, result)
            });
        }

        while let Some(joined) = requests.join_next().await {
            let Ok((peer_id, result)) = joined else {
                continue;
            };
            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(node_id = self.id, peer_id, term, error = %e, "Vote request failed");
                    continue;
                }
            };

            let mut state = self.state.lock().await;
            if resp.term > state.current_term {
                // Higher term seen, become follower
                tracing::info!(
                    node_id = self.id,
                    term,
                    observed_term = resp.term,
                    "Higher term in vote reply, abandoning election"
                );
                state.become_follower(resp.term);
                if let Err(e) = state.persist() {
                    drop(state);
                    self.halt(&e);
                }
                return;
            }
            if state.role != RaftRole::Candidate || state.current_term != term {
                // Superseded by a newer election or a leader's heartbeat
                return;
            }
            if resp.vote_granted {
                state.votes_received += 1;
                tracing::debug!(
                    node_id = self.id,
                    peer_id,
                    term,
                    votes = state.votes_received,
                    "Received vote"
                );
                if state.votes_received >= quorum {
                    self.win_election(&mut state, term);
                    return;
                }
            }
        }

        tracing::debug!(
            node_id = self.id,
            term,
            needed = quorum,
            "Election round ended without a majority"
        );
    }

    /// Flip to leader (caller holds the lock and has re-validated the term).
    fn win_election(self: &Arc<Self>, state: &mut RaftState, term: u64) {
        state.become_leader(self.id, &self.config.peer_ids());
        tracing::info!(
            node_id = self.id,
            term,
            votes = state.votes_received,
            "Became leader"
        );
        tokio::spawn(self.clone().run_replication(term));
    }

    /// Leader side: periodic AppendEntries to every peer for one leadership term.
    async fn run_replication(self: Arc<Self>, term: u64) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<AppendOutcome> = JoinSet::new();
        let mut busy: HashSet<u64> = HashSet::new();
        let peers = self.config.peer_ids();

        loop {
            let keep_going = tokio::select! {
                _ = self.shutdown.cancelled() => false,

                _ = ticker.tick() => {
                    self.replicate_to_idle_peers(term, &peers, &mut busy, &mut in_flight).await
                }

                _ = self.replicate_notify.notified() => {
                    self.replicate_to_idle_peers(term, &peers, &mut busy, &mut in_flight).await
                }

                Some(joined) = in_flight.join_next() => {
                    match joined {
                        Ok((peer_id, prev_log_index, sent, result)) => {
                            busy.remove(&peer_id);
                            match self.handle_append_reply(term, peer_id, prev_log_index, sent, result).await {
                                ReplicationStep::Idle => true,
                                ReplicationStep::Resend => {
                                    busy.insert(peer_id);
                                    self.send_append_entries(term, peer_id, &mut in_flight).await
                                }
                                ReplicationStep::Stop => false,
                            }
                        }
                        Err(e) => {
                            tracing::warn!(node_id = self.id, error = %e, "AppendEntries task failed");
                            true
                        }
                    }
                }
            };

            if !keep_going {
                break;
            }
        }

        tracing::debug!(node_id = self.id, term, "Replication coordinator stopped");
    }

    async fn replicate_to_idle_peers(
        &self,
        term: u64,
        peers: &[u64],
        busy: &mut HashSet<u64>,
        in_flight: &mut JoinSet<AppendOutcome>,
    ) -> bool {
        for &peer_id in peers {
            if busy.contains(&peer_id) {
                continue;
            }
            if !self.send_append_entries(term, peer_id, in_flight).await {
                return false;
            }
            busy.insert(peer_id);
        }
        true
    }

    /// Send everything from `next_index[peer]` onward. Returns `false` if this
    /// node is no longer leader for `term`.
    async fn send_append_entries(
        &self,
        term: u64,
        peer_id: u64,
        in_flight: &mut JoinSet<AppendOutcome>,
    ) -> bool {
        let req = {
            let state = self.state.lock().await;
            if state.role != RaftRole::Leader || state.current_term != term {
                return false;
            }
            let next_index = state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(state.last_log_index() + 1)
                .max(1);
            let prev_log_index = next_index - 1;
            AppendEntriesArgs {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term: state.log.term_at(prev_log_index).unwrap_or(0),
                entries: state.log.entries_from(next_index),
                leader_commit: state.commit_index,
            }
        };

        let prev_log_index = req.prev_log_index;
        let sent = req.entries.len() as u64;
        if sent == 0 {
            tracing::trace!(node_id = self.id, peer_id, term, "Sending heartbeat");
        } else {
            tracing::debug!(
                node_id = self.id,
                peer_id,
                term,
                prev_log_index,
                entries = sent,
                "Sending entries"
            );
        }

        let transport = self.transport.clone();
        let rpc_timeout = self.config.rpc_timeout();
        in_flight.spawn(async move {
            let result = match timeout(rpc_timeout, transport.append_entries(peer_id, req)).await {
                Ok(result) => result,
                Err(_) => Err(RaftError::Timeout(peer_id)),
            };
            (peer_id, prev_log_index, sent, result)
        });
        true
    }

    async fn handle_append_reply(
        &self,
        term: u64,
        peer_id: u64,
        prev_log_index: u64,
        sent: u64,
        result: Result<AppendEntriesReply>,
    ) -> ReplicationStep {
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer_id, error = %e, "AppendEntries failed");
                return ReplicationStep::Idle;
            }
        };

        let mut state = self.state.lock().await;

        if resp.term > state.current_term {
            tracing::info!(
                node_id = self.id,
                peer_id,
                term,
                observed_term = resp.term,
                "Higher term in AppendEntries reply, stepping down"
            );
            state.become_follower(resp.term);
            if let Err(e) = state.persist() {
                drop(state);
                self.halt(&e);
            }
            return ReplicationStep::Stop;
        }
        if state.role != RaftRole::Leader || state.current_term != term {
            return ReplicationStep::Stop;
        }

        if resp.success {
            let matched = prev_log_index + sent;
            let match_index = state.match_index.entry(peer_id).or_insert(0);
            if matched > *match_index {
                *match_index = matched;
            }
            let match_index = *match_index;
            state.next_index.insert(peer_id, match_index + 1);

            if state.advance_commit_index(self.config.quorum()) {
                tracing::debug!(
                    node_id = self.id,
                    commit_index = state.commit_index,
                    "Updated commit index"
                );
                self.commit_tx.send_replace(state.commit_index);
            }

            if match_index < state.last_log_index() {
                ReplicationStep::Resend
            } else {
                ReplicationStep::Idle
            }
        } else {
            let current = state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(prev_log_index + 1);
            if current != prev_log_index + 1 {
                // Reply to an older request; next_index already moved
                return ReplicationStep::Idle;
            }
            let next = next_index_after_conflict(&state, current, &resp);
            tracing::debug!(
                node_id = self.id,
                peer_id,
                from = current,
                to = next,
                conflict_term = resp.conflict_term,
                "Log mismatch, retreating next index"
            );
            state.next_index.insert(peer_id, next);
            ReplicationStep::Resend
        }
    }

    /// Deliver committed entries to the application, in order, one batch per
    /// commit notification.
    async fn run_applier(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();

        loop {
            let entries = self.state.lock().await.take_unapplied();
            for entry in entries {
                tracing::trace!(node_id = self.id, index = entry.index, "Applying entry");
                let msg = ApplyMsg {
                    index: entry.index,
                    term: entry.term,
                    command: entry.command,
                };
                if self.apply_tx.send(msg).is_err() {
                    tracing::warn!(node_id = self.id, "Apply channel closed, stopping applier");
                    return;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Append a command to the log (leader only).
    ///
    /// Returns the index and term the entry will hold if it is ever committed.
    /// Commitment is reported only through the apply channel.
    pub async fn submit(&self, command: Vec<u8>) -> Result<(u64, u64)> {
        if self.is_stopped() {
            return Err(RaftError::Stopped);
        }

        let mut state = self.state.lock().await;
        let (index, term) = match state.append_command(command) {
            Ok(appended) => appended,
            Err(e @ RaftError::Persistence(_)) => {
                drop(state);
                self.halt(&e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(node_id = self.id, index, term, "Appended command to log");

        if state.advance_commit_index(self.config.quorum()) {
            self.commit_tx.send_replace(state.commit_index);
        }
        drop(state);

        self.replicate_notify.notify_one();
        Ok((index, term))
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_request_vote(&self, req: RequestVoteArgs) -> Result<RequestVoteReply> {
        if self.is_stopped() {
            return Err(RaftError::Stopped);
        }

        let mut state = self.state.lock().await;
        let response = match rpc::handle_request_vote(&mut state, &req, self.id) {
            Ok(response) => response,
            Err(e) => {
                drop(state);
                self.halt(&e);
                return Err(e);
            }
        };
        drop(state);

        // Reset election timeout if we granted vote
        if response.vote_granted {
            let _ = self.event_tx.try_send(RaftEvent::VoteGranted {
                candidate_id: req.candidate_id,
                term: req.term,
            });
        }

        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(&self, req: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        if self.is_stopped() {
            return Err(RaftError::Stopped);
        }

        let mut state = self.state.lock().await;
        let commit_before = state.commit_index;
        let response = match rpc::handle_append_entries(&mut state, &req, self.id) {
            Ok(response) => response,
            Err(e) => {
                drop(state);
                self.halt(&e);
                return Err(e);
            }
        };
        if state.commit_index > commit_before {
            self.commit_tx.send_replace(state.commit_index);
        }
        drop(state);

        // Any AppendEntries from a current leader resets the election timeout
        if response.term == req.term {
            let _ = self.event_tx.try_send(RaftEvent::HeartbeatReceived {
                leader_id: req.leader_id,
                term: req.term,
            });
        }

        Ok(response)
    }

    /// Current term and whether this node believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.is_leader())
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.is_leader()
    }

    /// Get the current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        let state = self.state.lock().await;
        if state.is_leader() {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    pub async fn status(&self) -> StatusReply {
        let state = self.state.lock().await;
        StatusReply {
            node_id: self.id,
            term: state.current_term,
            is_leader: state.is_leader(),
            leader_id: if state.is_leader() {
                Some(self.id)
            } else {
                state.leader_id
            },
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
        }
    }

    /// Stop participating after a persistence failure.
    fn halt(&self, err: &RaftError) {
        tracing::error!(node_id = self.id, error = %err, "Persistence failed, halting node");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::LogEntry;
    use crate::raft::persist::MemoryPersister;
    use crate::transport::LocalNetwork;
    use std::io;
    use std::time::Duration;

    struct FailingPersister;

    impl Persister for FailingPersister {
        fn save_state(&self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn load_state(&self) -> io::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn new_node(
        persister: Arc<dyn Persister>,
    ) -> (Arc<RaftNode>, mpsc::UnboundedReceiver<ApplyMsg>) {
        let config = NodeConfig::default()
            .with_peer(2, "127.0.0.1:50052".to_string())
            .with_peer(3, "127.0.0.1:50053".to_string());
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (node, _rx) =
            RaftNode::new(config, LocalNetwork::new().transport(1), persister, apply_tx).unwrap();
        (node, apply_rx)
    }

    #[tokio::test]
    async fn submit_on_follower_is_rejected() {
        let (node, _apply_rx) = new_node(Arc::new(MemoryPersister::new()));
        let err = node.submit(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader(None)));
    }

    #[tokio::test]
    async fn persistence_failure_halts_node() {
        let (node, _apply_rx) = new_node(Arc::new(FailingPersister));

        let req = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let err = node.handle_request_vote(req.clone()).await.unwrap_err();
        assert!(matches!(err, RaftError::Persistence(_)));
        assert!(node.is_stopped());

        let err = node.handle_request_vote(req).await.unwrap_err();
        assert!(matches!(err, RaftError::Stopped));
    }

    #[tokio::test]
    async fn applier_delivers_committed_entries_in_order() {
        let (node, mut apply_rx) = new_node(Arc::new(MemoryPersister::new()));
        tokio::spawn(node.clone().run_applier());

        let req = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: (1..=3)
                .map(|i| LogEntry {
                    index: i,
                    term: 1,
                    command: vec![i as u8],
                })
                .collect(),
            leader_commit: 2,
        };
        assert!(node.handle_append_entries(req).await.unwrap().success);

        for expected in 1..=2u64 {
            let msg = tokio::time::timeout(Duration::from_secs(1), apply_rx.recv())
                .await
                .expect("apply in time")
                .expect("channel open");
            assert_eq!(msg.index, expected);
            assert_eq!(msg.command, vec![expected as u8]);
        }
        assert!(apply_rx.try_recv().is_err());
        node.shutdown();
    }
}
