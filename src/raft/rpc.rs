use crate::error::Result;
use crate::proto::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::raft::state::{RaftRole, RaftState};

/// Handle RequestVote RPC.
///
/// Any change to `current_term` or `voted_for` is persisted before the reply
/// is returned.
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &RequestVoteArgs,
    my_id: u64,
) -> Result<RequestVoteReply> {
    // If request term is greater, update our term and become follower
    let mut dirty = state.observe_term(req.term);

    let vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state
        .log
        .is_up_to_date(req.last_log_index, req.last_log_term)
    {
        // Candidate's log is not up-to-date
        false
    } else {
        if state.voted_for != Some(req.candidate_id) {
            state.voted_for = Some(req.candidate_id);
            dirty = true;
        }
        true
    };

    if dirty {
        state.persist()?;
    }

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    Ok(RequestVoteReply {
        term: state.current_term,
        vote_granted,
    })
}

/// Handle AppendEntries RPC.
///
/// A reply whose `term` equals the request's term means the sender was
/// accepted as leader for that term (the caller resets its election timer).
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesArgs,
    my_id: u64,
) -> Result<AppendEntriesReply> {
    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return Ok(AppendEntriesReply {
            term: state.current_term,
            success: false,
            conflict_index: 0,
            conflict_term: 0,
        });
    }

    // If request term is greater, update our term and become follower
    let mut dirty = state.observe_term(req.term);

    // Valid AppendEntries from leader - reset to follower if we're a candidate
    if state.role != RaftRole::Follower {
        state.step_down();
    }
    state.leader_id = Some(req.leader_id);

    // Check if we have the prev_log entry
    match state.log.term_at(req.prev_log_index) {
        None => {
            if dirty {
                state.persist()?;
            }
            return Ok(AppendEntriesReply {
                term: state.current_term,
                success: false,
                conflict_index: state.last_log_index() + 1,
                conflict_term: 0,
            });
        }
        Some(term) if term != req.prev_log_term => {
            if dirty {
                state.persist()?;
            }
            return Ok(AppendEntriesReply {
                term: state.current_term,
                success: false,
                conflict_index: state.log.first_index_of_term(term, req.prev_log_index),
                conflict_term: term,
            });
        }
        Some(_) => {}
    }

    // Append new entries (if any)
    if !req.entries.is_empty() && state.log.merge(req.prev_log_index, &req.entries) {
        dirty = true;
        tracing::debug!(
            node_id = my_id,
            entries_received = req.entries.len(),
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    if dirty {
        state.persist()?;
    }

    // Update commit index
    let last_new_index = req.prev_log_index + req.entries.len() as u64;
    if state.follow_commit_index(req.leader_commit, last_new_index) {
        tracing::debug!(
            node_id = my_id,
            commit_index = state.commit_index,
            "Follower commit index advanced"
        );
    }

    Ok(AppendEntriesReply {
        term: state.current_term,
        success: true,
        conflict_index: 0,
        conflict_term: 0,
    })
}

/// Where the leader should resume sending to a follower after a rejected
/// AppendEntries. The result is clamped to `[1, current_next]`.
pub fn next_index_after_conflict(
    state: &RaftState,
    current_next: u64,
    reply: &AppendEntriesReply,
) -> u64 {
    let hinted = if reply.conflict_term != 0 {
        match state.log.last_index_of_term(reply.conflict_term) {
            Some(last) => last + 1,
            None => reply.conflict_index,
        }
    } else {
        reply.conflict_index
    };
    let fallback = current_next.saturating_sub(1);
    let next = if hinted == 0 || hinted >= current_next {
        fallback
    } else {
        hinted
    };
    next.clamp(1, current_next.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::LogEntry;
    use crate::raft::persist::MemoryPersister;
    use std::sync::Arc;

    fn new_state() -> RaftState {
        RaftState::new(Arc::new(MemoryPersister::new()))
    }

    fn leader_log(terms: &[u64]) -> RaftState {
        let mut state = new_state();
        for &term in terms {
            state.log.append(term, Vec::new());
        }
        state
    }

    fn reply(conflict_index: u64, conflict_term: u64) -> AppendEntriesReply {
        AppendEntriesReply {
            term: 1,
            success: false,
            conflict_index,
            conflict_term,
        }
    }

    #[test]
    fn test_conflict_with_missing_entries_jumps_to_follower_end() {
        let state = leader_log(&[1, 1, 1, 1, 1]);
        // Follower has only 2 entries
        assert_eq!(next_index_after_conflict(&state, 6, &reply(3, 0)), 3);
    }

    #[test]
    fn test_conflict_term_known_to_leader() {
        let state = leader_log(&[1, 2, 2, 4, 4]);
        // Follower holds term 2 at prev_log_index; leader's last term-2 entry is 3
        assert_eq!(next_index_after_conflict(&state, 5, &reply(2, 2)), 4);
    }

    #[test]
    fn test_conflict_term_unknown_to_leader() {
        let state = leader_log(&[1, 4, 4, 4]);
        // Follower has term 3 entries starting at 2; leader has none of term 3
        assert_eq!(next_index_after_conflict(&state, 5, &reply(2, 3)), 2);
    }

    #[test]
    fn test_conflict_never_moves_forward_or_to_zero() {
        let state = leader_log(&[1, 1, 1]);
        assert_eq!(next_index_after_conflict(&state, 3, &reply(9, 0)), 2);
        assert_eq!(next_index_after_conflict(&state, 1, &reply(0, 0)), 1);
    }

    #[test]
    fn test_mismatch_does_not_truncate() {
        let mut state = new_state();
        state.current_term = 2;
        state.log.append(1, Vec::new());
        state.log.append(1, Vec::new());

        let req = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 2,
            prev_log_term: 2,
            entries: vec![LogEntry {
                index: 3,
                term: 2,
                command: Vec::new(),
            }],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &req, 1).unwrap();

        assert!(!resp.success);
        assert_eq!(resp.conflict_term, 1);
        assert_eq!(resp.conflict_index, 1);
        assert_eq!(state.log.len(), 2);
    }

    #[test]
    fn test_repeat_vote_for_same_candidate() {
        let mut state = new_state();
        let req = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(handle_request_vote(&mut state, &req, 1).unwrap().vote_granted);
        // A duplicated request is answered the same way
        assert!(handle_request_vote(&mut state, &req, 1).unwrap().vote_granted);
        assert_eq!(state.voted_for, Some(2));
    }
}
