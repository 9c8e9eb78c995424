use super::log::LogEntry;
use super::signal::Latches;
use super::store::PersistentState;
use quorum_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Work the replication drivers must carry out next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCmd {
    None,
    RequestVote,
    AppendEntries,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyState {
    Idle,
    Busy,
    Disconnected,
    /// Known member that does not count toward the cluster size yet.
    PendingAdd,
}

/// Per-peer replication cursor and liveness.
#[derive(Debug, Clone)]
pub struct PeerProxy {
    pub id: NodeId,
    pub state: ProxyState,
    pub match_index: LogIndex,   // Highest index confirmed on the peer
    pub log_replicated: bool,    // Peer holds the in-flight entry
    pub epoch: u64,              // Distinguishes a re-added peer from its old driver
    pub vote_requested_term: Term,
}

impl PeerProxy {
    pub fn new(id: NodeId, epoch: u64, state: ProxyState) -> Self {
        Self {
            id,
            state,
            match_index: 0,
            log_replicated: false,
            epoch,
            vote_requested_term: 0,
        }
    }

    pub fn is_member(&self) -> bool {
        self.state != ProxyState::PendingAdd
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ProxyState::Idle | ProxyState::Busy)
    }
}

/// Votes or acknowledgements needed out of `cluster_size` members.
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Everything the consensus threads share. Lives behind one mutex.
#[derive(Debug)]
pub struct RaftState {
    pub id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub voted_for_term: Term,
    pub vote_consensus_term: Term,
    pub vote_consensus_cnt: usize,
    pub vote_denied_cnt: usize,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub first_log_index: LogIndex,
    pub commit_index: LogIndex,
    pub commit_index_term: Term,
    pub last_applied: LogIndex,
    pub leader: Option<NodeId>,
    pub disallow_updates: bool,
    pub quorum_override: bool,
    pub cmd: ReplCmd,
    pub pending_entry: Option<LogEntry>,
    /// `None` once the election deadline is considered expired.
    pub last_ping_recv: Option<Instant>,
    pub index_to_apply: LogIndex,
    pub op_counts: u64,
    pub compacted_since_persist: u64,
    pub peers: BTreeMap<NodeId, PeerProxy>,
    pub(crate) latches: Latches,
    pub(crate) request_gen: u64,
    pub(crate) shutdown: bool,
    next_epoch: u64,
}

impl RaftState {
    pub fn new(id: NodeId, persisted: &PersistentState) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for.clone(),
            voted_for_term: persisted.voted_for_term,
            vote_consensus_term: 0,
            vote_consensus_cnt: 0,
            vote_denied_cnt: 0,
            last_log_index: persisted.last_applied,
            last_log_term: 0,
            first_log_index: persisted.first_log_index,
            commit_index: persisted.last_applied,
            commit_index_term: 0,
            last_applied: persisted.last_applied,
            leader: None,
            disallow_updates: false,
            quorum_override: false,
            cmd: ReplCmd::None,
            pending_entry: None,
            last_ping_recv: Some(Instant::now()),
            index_to_apply: persisted.last_applied,
            op_counts: 0,
            compacted_since_persist: 0,
            peers: BTreeMap::new(),
            latches: Latches::default(),
            request_gen: 0,
            shutdown: false,
            next_epoch: 1,
        }
    }

    /// Registers a peer under a fresh epoch and returns that epoch.
    pub fn insert_peer(&mut self, id: NodeId, state: ProxyState) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.peers.insert(id.clone(), PeerProxy::new(id, epoch, state));
        epoch
    }

    pub fn peer(&self, id: &str, epoch: u64) -> Option<&PeerProxy> {
        self.peers.get(id).filter(|p| p.epoch == epoch)
    }

    pub fn peer_mut(&mut self, id: &str, epoch: u64) -> Option<&mut PeerProxy> {
        self.peers.get_mut(id).filter(|p| p.epoch == epoch)
    }

    /// Self plus every peer that is a full member.
    pub fn cluster_size(&self) -> usize {
        1 + self.peers.values().filter(|p| p.is_member()).count()
    }

    pub fn peers_idle(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == ProxyState::Idle)
            .count()
    }

    pub fn peers_connected(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    /// Leader plus peers that hold the in-flight entry.
    pub fn append_consensus_count(&self) -> usize {
        1 + self
            .peers
            .values()
            .filter(|p| p.is_member() && p.log_replicated)
            .count()
    }

    pub fn has_append_consensus(&self) -> bool {
        self.append_consensus_count() >= majority(self.cluster_size())
    }

    pub fn has_vote_majority(&self) -> bool {
        self.vote_consensus_cnt >= majority(self.cluster_size())
    }

    pub fn clear_replicated(&mut self) {
        for peer in self.peers.values_mut() {
            peer.log_replicated = false;
        }
    }

    /// True when our log is more up to date than `(last_log_term, last_log_index)`.
    pub fn log_longer_than(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        self.last_log_term > last_log_term
            || (self.last_log_term == last_log_term && self.last_log_index > last_log_index)
    }

    pub fn ping_elapsed(&self) -> Option<Duration> {
        self.last_ping_recv.map(|t| t.elapsed())
    }

    pub fn reset_ping(&mut self) {
        self.last_ping_recv = Some(Instant::now());
    }

    /// Increments the term and votes for self. Returns the new term.
    pub fn become_candidate(&mut self) -> Term {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.voted_for_term = self.current_term;
        self.vote_consensus_term = self.current_term;
        self.vote_consensus_cnt = 1;
        self.vote_denied_cnt = 0;
        self.leader = None;
        self.current_term
    }

    /// Takes leadership and returns the no-op entry that opens the term.
    pub fn become_leader(&mut self) -> LogEntry {
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        self.cmd = ReplCmd::None;
        for peer in self.peers.values_mut() {
            peer.match_index = 0;
            peer.log_replicated = false;
        }
        LogEntry::no_op(self.last_log_index + 1, self.current_term)
    }

    /// Adopts a newer term seen on the wire. Returns whether the term moved.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.role = Role::Follower;
            self.leader = None;
            true
        } else {
            false
        }
    }

    /// Records that `index` (created in `term`) is applied locally.
    pub fn advance_applied(&mut self, index: LogIndex, term: Term) {
        if index > self.last_applied {
            self.last_applied = index;
        }
        if index > self.commit_index {
            self.commit_index = index;
            self.commit_index_term = term;
        }
        if index > self.last_log_index {
            self.last_log_index = index;
            self.last_log_term = term;
        }
    }

    /// Checks the ordering of the log watermarks.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.first_log_index > self.last_applied + 1 {
            return Err(format!(
                "first_log_index {} beyond last_applied {}",
                self.first_log_index, self.last_applied
            ));
        }
        if self.last_applied > self.commit_index {
            return Err(format!(
                "last_applied {} beyond commit_index {}",
                self.last_applied, self.commit_index
            ));
        }
        if self.commit_index > self.last_log_index {
            return Err(format!(
                "commit_index {} beyond last_log_index {}",
                self.commit_index, self.last_log_index
            ));
        }
        Ok(())
    }
}
