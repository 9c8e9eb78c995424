use super::node::RaftCore;
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AppendStatus, RequestVoteRequest,
    RequestVoteResponse, VoteStatus,
};
use super::signal::Wake;
use super::state::{ProxyState, RaftState, Role};
use super::store::PersistedVar;
use quorum_common::types::{LogIndex, Term};
use quorum_common::{QuorumError, Result};
use tracing::{debug, info, warn};

impl RaftCore {
    /// Inbound RequestVote. The vote and any term change are durable before
    /// the reply leaves.
    pub(crate) fn handle_request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let _reply = self.rpc_reply.lock();
        let mut vars = Vec::new();

        let (term, vote) = {
            let mut st = self.state.lock();
            if st.shutdown {
                return Err(QuorumError::Shutdown);
            }

            let vote = decide_vote(&st, &req);
            let old_term = st.current_term;
            let was = st.role;
            if st.observe_term(req.term) {
                if was != Role::Follower {
                    self.step_down_locked(&mut st);
                }
                if vote == VoteStatus::DeniedLogLonger {
                    // Our log is ahead: stand for election instead of waiting.
                    st.last_ping_recv = None;
                    self.signals.notify(&mut st, Wake::VoteRequest);
                } else {
                    st.reset_ping();
                }
                vars.push(PersistedVar::Term(req.term));
                info!(node = %self.id, old_term, term = req.term, candidate = %req.candidate_id, "adopted newer term from candidate");
            }

            if vote == VoteStatus::Granted {
                st.voted_for = Some(req.candidate_id.clone());
                st.voted_for_term = st.current_term;
                st.reset_ping();
                vars.push(PersistedVar::Vote {
                    term: st.current_term,
                    candidate: req.candidate_id.clone(),
                });
            }

            if let Some(peer) = st.peers.get_mut(&req.candidate_id) {
                if peer.state == ProxyState::PendingAdd {
                    peer.state = ProxyState::Disconnected;
                    info!(node = %self.id, peer = %req.candidate_id, "pending peer joined the cluster");
                    self.signals.broadcast_request(&mut st);
                }
            }

            (st.current_term, vote)
        };

        if !vars.is_empty() {
            self.persist_vars(&vars)?;
        }

        info!(
            node = %self.id,
            candidate = %req.candidate_id,
            term = req.term,
            last_log_index = req.last_log_index,
            last_log_term = req.last_log_term,
            ?vote,
            "vote request answered"
        );
        Ok(RequestVoteResponse { term, vote })
    }

    /// Inbound AppendEntries or ping. Holds the store transaction for the
    /// whole handler so truncation and append land together.
    pub(crate) fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let _reply = self.rpc_reply.lock();
        let mut txn = self.store.begin_write()?;
        let mut st = self.state.lock();
        if st.shutdown {
            return Err(QuorumError::Shutdown);
        }

        let leader_known = st
            .peers
            .get(&req.leader_id)
            .map_or(false, |p| p.is_connected());
        if !leader_known {
            return Err(QuorumError::UnwillingToPerform(format!(
                "{} is not a connected member",
                req.leader_id
            )));
        }

        if let Some(first) = req.entries.first() {
            if first.index != req.prev_log_index + 1 {
                return Err(QuorumError::InvalidRequest(format!(
                    "entry {} does not follow prev {}",
                    first.index, req.prev_log_index
                )));
            }
        }

        if req.term < st.current_term {
            debug!(node = %self.id, leader = %req.leader_id, term = req.term, current = st.current_term, "stale append entries");
            return Ok(AppendEntriesResponse {
                term: st.current_term,
                status: AppendStatus::Mismatch {
                    last_log_index: st.last_log_index,
                },
            });
        }

        let term_moved = req.term > st.current_term;
        if term_moved {
            txn.persist(PersistedVar::Term(req.term))?;
        }

        if st.role != Role::Follower {
            if term_moved {
                // Step down and let the leader retry against a follower.
                st.observe_term(req.term);
                self.step_down_locked(&mut st);
                st.reset_ping();
                txn.commit()?;
                return Err(QuorumError::UnwillingToPerform(format!(
                    "switched to follower for term {}",
                    req.term
                )));
            }
            if st.role == Role::Leader {
                warn!(node = %self.id, leader = %req.leader_id, term = req.term, "append entries from another leader in our term");
                return Err(QuorumError::UnwillingToPerform("already leader in this term".into()));
            }
            self.step_down_locked(&mut st);
        }

        st.observe_term(req.term);
        st.role = Role::Follower;
        st.reset_ping();
        if st.leader.as_deref() != Some(req.leader_id.as_str()) {
            info!(node = %self.id, leader = %req.leader_id, term = req.term, "following new leader");
            st.leader = Some(req.leader_id.clone());
        }

        if !self.prev_log_matches(&st, req.prev_log_index, req.prev_log_term)? {
            let last_log_index = st.last_log_index;
            txn.commit()?;
            debug!(node = %self.id, prev = req.prev_log_index, last_log_index, "prev log mismatch");
            return Ok(AppendEntriesResponse {
                term: st.current_term,
                status: AppendStatus::Mismatch { last_log_index },
            });
        }

        // Skip what we already hold; truncate the rest of our tail.
        let mut skip = 0;
        for entry in &req.entries {
            let held = if entry.index < st.first_log_index {
                true
            } else if entry.index > st.last_log_index {
                false
            } else {
                self.store.read_log(entry.index)?.map(|e| e.term) == Some(entry.term)
            };
            if !held {
                break;
            }
            skip += 1;
        }
        let new_entries = &req.entries[skip..];

        if let Some(first) = new_entries.first() {
            if first.index <= st.last_log_index && first.index <= st.commit_index {
                // The adopted term still has to be durable.
                txn.commit()?;
                return Err(QuorumError::LogConsistency(format!(
                    "leader {} would overwrite committed log {} (commit index {})",
                    req.leader_id, first.index, st.commit_index
                )));
            }
            for index in first.index..=st.last_log_index {
                txn.delete_log(index)?;
            }
            for entry in new_entries {
                txn.append_log(entry)?;
            }
        }

        let commit = st.commit_index.max(req.leader_commit.min(req.prev_log_index));
        let commit_term = if commit > st.commit_index {
            Some(self.term_at(&st, &req, commit)?)
        } else {
            None
        };

        txn.commit()?;

        if let Some(last) = new_entries.last() {
            st.last_log_index = last.index;
            st.last_log_term = last.term;
            st.op_counts += 1;
        }
        if let Some(term) = commit_term {
            st.commit_index = commit;
            st.commit_index_term = term;
        }
        st.index_to_apply = st.commit_index;
        if st.commit_index > st.last_applied {
            self.signals.notify(&mut st, Wake::NewLog);
        }

        Ok(AppendEntriesResponse {
            term: st.current_term,
            status: AppendStatus::Success,
        })
    }

    fn prev_log_matches(&self, st: &RaftState, prev: LogIndex, prev_term: Term) -> Result<bool> {
        if prev == 0 || prev < st.first_log_index {
            return Ok(true);
        }
        if prev > st.last_log_index {
            return Ok(false);
        }
        Ok(self.store.read_log(prev)?.map(|e| e.term) == Some(prev_term))
    }

    fn term_at(&self, st: &RaftState, req: &AppendEntriesRequest, index: LogIndex) -> Result<Term> {
        if index == req.prev_log_index {
            return Ok(req.prev_log_term);
        }
        if index == st.commit_index {
            return Ok(st.commit_index_term);
        }
        self.store
            .read_log(index)?
            .map(|e| e.term)
            .ok_or(QuorumError::LogMissing(index))
    }
}

/// Vote rules, evaluated against our state before any term change.
fn decide_vote(st: &RaftState, req: &RequestVoteRequest) -> VoteStatus {
    if st.log_longer_than(req.last_log_term, req.last_log_index) {
        return VoteStatus::DeniedLogLonger;
    }
    if req.term < st.current_term {
        return VoteStatus::Denied;
    }
    if st.role == Role::Leader && req.term == st.current_term {
        return VoteStatus::Denied;
    }
    if st.voted_for_term == req.term
        && st.voted_for.is_some()
        && st.voted_for.as_deref() != Some(req.candidate_id.as_str())
    {
        return VoteStatus::Denied;
    }
    VoteStatus::Granted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::{LogEntry, LogOperation};
    use crate::raft::store::{LogStore, MemoryStore};
    use crate::raft::testing::{connect_all, open_core};
    use crate::raft::transport::LocalNetwork;
    use std::sync::Arc;

    fn vote_req(candidate: &str, term: Term, last_log_index: LogIndex, last_log_term: Term) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index,
            last_log_term,
        }
    }

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::from_operations(index, term, vec![LogOperation::add(index, "cn=x")]).unwrap()
    }

    fn follower(store: Arc<MemoryStore>) -> Arc<RaftCore> {
        let core = open_core("n2", &["n1", "n2", "n3"], store, &LocalNetwork::new());
        connect_all(&core);
        core
    }

    fn seed_log(store: &MemoryStore, entries: &[LogEntry]) {
        let mut txn = store.begin_write().unwrap();
        for e in entries {
            txn.append_log(e).unwrap();
        }
        txn.commit().unwrap();
    }

    fn append(leader_term: Term, prev: (LogIndex, Term), entries: Vec<LogEntry>, commit: LogIndex) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: leader_term,
            leader_id: "n1".into(),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn test_grants_one_vote_per_term() {
        let store = Arc::new(MemoryStore::new());
        let core = follower(Arc::clone(&store));

        let resp = core.handle_request_vote(vote_req("n1", 1, 0, 0)).unwrap();
        assert_eq!((resp.term, resp.vote), (1, VoteStatus::Granted));
        // Same candidate again is fine, a rival is not.
        assert!(core.handle_request_vote(vote_req("n1", 1, 0, 0)).unwrap().granted());
        assert_eq!(
            core.handle_request_vote(vote_req("n3", 1, 0, 0)).unwrap().vote,
            VoteStatus::Denied
        );

        let persisted = store.state();
        assert_eq!(persisted.current_term, 1);
        assert_eq!(persisted.voted_for.as_deref(), Some("n1"));
        assert_eq!(persisted.voted_for_term, 1);
    }

    #[test]
    fn test_denies_stale_term_and_shorter_log() {
        let store = Arc::new(MemoryStore::new());
        seed_log(&store, &[entry(1, 2), entry(2, 2)]);
        let core = follower(store);
        core.state.lock().current_term = 3;

        assert_eq!(
            core.handle_request_vote(vote_req("n1", 2, 9, 2)).unwrap().vote,
            VoteStatus::Denied
        );

        let resp = core.handle_request_vote(vote_req("n3", 4, 1, 2)).unwrap();
        assert_eq!(resp.vote, VoteStatus::DeniedLogLonger);
        assert_eq!(resp.term, 4);
        let st = core.state.lock();
        assert_eq!(st.role, Role::Follower);
        assert!(st.last_ping_recv.is_none());
    }

    #[test]
    fn test_leader_denies_same_term_and_yields_to_higher() {
        let core = follower(Arc::new(MemoryStore::new()));
        {
            let mut st = core.state.lock();
            st.current_term = 5;
            st.role = Role::Leader;
        }

        assert!(!core.handle_request_vote(vote_req("n3", 5, 0, 0)).unwrap().granted());
        assert!(core.handle_request_vote(vote_req("n3", 6, 0, 0)).unwrap().granted());
        assert_eq!(core.state.lock().role, Role::Follower);
    }

    #[test]
    fn test_vote_promotes_pending_peer() {
        let core = follower(Arc::new(MemoryStore::new()));
        core.state
            .lock()
            .insert_peer("n4".into(), ProxyState::PendingAdd);
        assert_eq!(core.state.lock().cluster_size(), 3);

        core.handle_request_vote(vote_req("n4", 1, 0, 0)).unwrap();
        assert_eq!(core.state.lock().cluster_size(), 4);
    }

    #[test]
    fn test_rejects_unknown_leader() {
        let core = open_core("n2", &["n1", "n2"], Arc::new(MemoryStore::new()), &LocalNetwork::new());
        let err = core.handle_append_entries(append(1, (0, 0), vec![], 0)).unwrap_err();
        assert!(err.is_unwilling());
    }

    #[test]
    fn test_append_and_advance_commit() {
        let store = Arc::new(MemoryStore::new());
        let core = follower(Arc::clone(&store));

        let resp = core
            .handle_append_entries(append(1, (0, 0), vec![entry(1, 1)], 0))
            .unwrap();
        assert_eq!(resp.status, AppendStatus::Success);
        let resp = core
            .handle_append_entries(append(1, (1, 1), vec![entry(2, 1)], 1))
            .unwrap();
        assert_eq!(resp.status, AppendStatus::Success);

        let st = core.state.lock();
        assert_eq!((st.last_log_index, st.last_log_term), (2, 1));
        assert_eq!((st.commit_index, st.commit_index_term), (1, 1));
        assert_eq!(st.index_to_apply, 1);
        assert_eq!(st.leader.as_deref(), Some("n1"));
        assert_eq!(store.entries().len(), 2);
        assert_eq!(store.state().current_term, 1);
    }

    #[test]
    fn test_missing_prev_returns_last_index_hint() {
        let store = Arc::new(MemoryStore::new());
        seed_log(&store, &(1..=10).map(|i| entry(i, 1)).collect::<Vec<_>>());
        let core = follower(store);
        core.state.lock().current_term = 1;

        let resp = core
            .handle_append_entries(append(1, (12, 1), vec![entry(13, 1)], 12))
            .unwrap();
        assert_eq!(resp.status, AppendStatus::Mismatch { last_log_index: 10 });
        assert_eq!(core.state.lock().last_log_index, 10);
    }

    #[test]
    fn test_conflicting_tail_is_replaced() {
        let store = Arc::new(MemoryStore::new());
        seed_log(&store, &[entry(1, 1), entry(2, 1), entry(3, 1)]);
        let core = follower(Arc::clone(&store));
        core.state.lock().current_term = 1;

        let resp = core
            .handle_append_entries(append(2, (1, 1), vec![entry(2, 2)], 1))
            .unwrap();
        assert_eq!(resp.status, AppendStatus::Success);

        let terms: Vec<_> = store.entries().iter().map(|e| (e.index, e.term)).collect();
        assert_eq!(terms, vec![(1, 1), (2, 2)]);
        assert_eq!(core.state.lock().last_log_index, 2);
    }

    #[test]
    fn test_duplicate_entry_keeps_log() {
        let store = Arc::new(MemoryStore::new());
        seed_log(&store, &[entry(1, 1), entry(2, 1)]);
        let core = follower(Arc::clone(&store));
        core.state.lock().current_term = 1;

        let resp = core
            .handle_append_entries(append(1, (0, 0), vec![entry(1, 1)], 0))
            .unwrap();
        assert_eq!(resp.status, AppendStatus::Success);
        assert_eq!(store.entries().len(), 2);
        assert_eq!(core.state.lock().last_log_index, 2);
    }

    #[test]
    fn test_refuses_to_truncate_committed_entries() {
        let store = Arc::new(MemoryStore::new());
        seed_log(&store, &[entry(1, 1), entry(2, 1)]);
        let core = follower(Arc::clone(&store));
        {
            let mut st = core.state.lock();
            st.current_term = 1;
            st.commit_index = 2;
        }

        let err = core
            .handle_append_entries(append(2, (1, 1), vec![entry(2, 2)], 2))
            .unwrap_err();
        assert!(matches!(err, QuorumError::LogConsistency(_)));
        assert_eq!(store.entries()[1].term, 1);
        let st = core.state.lock();
        assert_eq!(st.current_term, 2);
        assert_eq!(store.state().current_term, st.current_term);
    }

    #[test]
    fn test_malformed_batch_leaves_term_alone() {
        let store = Arc::new(MemoryStore::new());
        let core = follower(Arc::clone(&store));
        core.state.lock().current_term = 1;

        let err = core
            .handle_append_entries(append(7, (0, 0), vec![entry(3, 7)], 0))
            .unwrap_err();
        assert!(matches!(err, QuorumError::InvalidRequest(_)));
        let st = core.state.lock();
        assert_eq!(st.current_term, 1);
        assert_eq!(store.state().current_term, 0);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_candidate_steps_down_on_higher_term() {
        let store = Arc::new(MemoryStore::new());
        let core = follower(Arc::clone(&store));
        {
            let mut st = core.state.lock();
            st.role = Role::Candidate;
            st.current_term = 2;
        }

        let err = core.handle_append_entries(append(3, (0, 0), vec![], 0)).unwrap_err();
        assert!(err.is_unwilling());
        let st = core.state.lock();
        assert_eq!((st.role, st.current_term), (Role::Follower, 3));
        assert_eq!(store.state().current_term, 3);
    }

    #[test]
    fn test_stale_leader_gets_our_term() {
        let core = follower(Arc::new(MemoryStore::new()));
        core.state.lock().current_term = 4;

        let resp = core.handle_append_entries(append(3, (0, 0), vec![], 0)).unwrap();
        assert_eq!(resp.term, 4);
        assert!(matches!(resp.status, AppendStatus::Mismatch { .. }));
    }
}
