use super::log::LogEntry;
use quorum_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Replicates log entries, or pings when `entries` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    /// Empty for a ping.
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// Outcome of the follower's consistency check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppendStatus {
    Success,
    /// The follower lacks `prev_log_index`; its own tail is the back-off hint.
    Mismatch { last_log_index: LogIndex },
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub status: AppendStatus,
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VoteStatus {
    Granted,
    Denied,
    /// Denied because the voter's log is more up to date than the candidate's.
    DeniedLogLonger,
}

/// Response to RequestVote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote: VoteStatus,
}

impl RequestVoteResponse {
    pub fn granted(&self) -> bool {
        self.vote == VoteStatus::Granted
    }
}
