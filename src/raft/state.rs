use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::proto::LogEntry;
use crate::raft::log::RaftLog;
use crate::raft::persist::{decode_state, encode_state, Persister};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// All consensus state of one node, guarded by a single lock in [`RaftNode`].
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`), and the
///   vote is persisted before the reply leaves the node
/// - Candidate must receive a strict majority of votes to become leader
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Enforced by:
/// - Leaders only append new entries via `append_command()`
/// - Log truncation only occurs on followers during replication conflicts
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, then the logs
/// are identical in all entries up through that index. Enforced by:
/// - `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Conflicting entries are truncated before appending
///
/// ## Leader Completeness
/// If a log entry is committed in a given term, that entry will be present
/// in the logs of all leaders for higher terms. Enforced by:
/// - Vote restriction: candidates must have up-to-date logs
/// - Leaders only count replicas for entries from their current term
///
/// ## State Machine Safety
/// Entries are only applied after being committed (`last_applied <= commit_index`)
/// and strictly in index order.
///
/// [`RaftNode`]: crate::raft::RaftNode
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,

    // Votes received in current election (for candidates)
    pub votes_received: u64,

    persister: Arc<dyn Persister>,
}

impl std::fmt::Debug for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftState")
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("role", &self.role)
            .field("last_log_index", &self.log.last_index())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("leader_id", &self.leader_id)
            .finish()
    }
}

impl RaftState {
    /// Fresh state that persists through `persister`. Nothing is read from it.
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            persister,
        }
    }

    /// Restore term, vote and log from `persister`, or start empty.
    pub fn restore(persister: Arc<dyn Persister>) -> Result<Self> {
        let blob = persister
            .load_state()
            .map_err(|e| RaftError::Persistence(format!("failed to load state: {e}")))?;
        let mut state = Self::new(persister);
        if let Some(blob) = blob {
            let saved = decode_state(&blob)?;
            state.current_term = saved.current_term;
            state.voted_for = saved.voted_for;
            state.log = RaftLog::from_entries(saved.entries);
        }
        Ok(state)
    }

    /// Durably write term, vote and log.
    pub fn persist(&self) -> Result<()> {
        let blob = encode_state(self.current_term, self.voted_for, self.log.entries());
        self.persister
            .save_state(&blob)
            .map_err(|e| RaftError::Persistence(format!("failed to save state: {e}")))
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    /// Adopt a newer term. Clears the vote; the caller persists.
    /// Returns `true` if the term advanced.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.step_down();
            true
        } else {
            false
        }
    }

    /// Transition to follower in the current term. The vote for this term is kept.
    pub fn step_down(&mut self) {
        self.role = RaftRole::Follower;
        self.votes_received = 0;
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Transition to follower at `term` (no-op on the term if it is not newer).
    pub fn become_follower(&mut self, term: u64) {
        if !self.observe_term(term) {
            self.step_down();
        }
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        // Initialize next_index and match_index for all peers
        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Append a command at the current term (leader only). Returns `(index, term)`.
    pub fn append_command(&mut self, command: Vec<u8>) -> Result<(u64, u64)> {
        if self.role != RaftRole::Leader {
            return Err(RaftError::NotLeader(self.leader_id));
        }
        let term = self.current_term;
        let index = self.log.append(term, command);
        self.persist()?;
        Ok((index, term))
    }

    /// Highest index replicated on `quorum` nodes (leader included) whose entry
    /// carries the current term. Moves `commit_index` forward only.
    /// Returns `true` if the commit index advanced.
    pub fn advance_commit_index(&mut self, quorum: usize) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }

        let mut match_indices: Vec<u64> = self.match_index.values().copied().collect();
        match_indices.push(self.last_log_index()); // Include self
        if match_indices.len() < quorum {
            return false;
        }
        match_indices.sort_unstable_by(|a, b| b.cmp(a));
        let majority_index = match_indices[quorum - 1];

        // Only entries from the current term are committed by counting replicas;
        // earlier entries are committed indirectly through them.
        let mut candidate = majority_index;
        while candidate > self.commit_index {
            if self.log.term_at(candidate) == Some(self.current_term) {
                self.commit_index = candidate;
                return true;
            }
            candidate -= 1;
        }
        false
    }

    /// Raise `commit_index` to `leader_commit`, capped at `last_new_index`. Never lowers it.
    pub fn follow_commit_index(&mut self, leader_commit: u64, last_new_index: u64) -> bool {
        let target = leader_commit.min(last_new_index);
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// Committed entries not yet handed to the state machine. Marks them applied.
    pub fn take_unapplied(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let entries = self
            .log
            .entries_between(self.last_applied + 1, self.commit_index);
        if let Some(last) = entries.last() {
            self.last_applied = last.index;
        }
        entries
    }
}
