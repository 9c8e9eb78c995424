//! Raft-derived replication core for a directory server.
//!
//! A [`RaftNode`] owns the shared consensus state and runs the background
//! threads (election, log applier, log compactor, one replication driver per
//! peer). Writes enter through [`RaftNode::submit`] or the two-phase
//! [`RaftNode::begin_replicated_write`] API, which ties cluster consensus to the
//! local store transaction.
//!
//! Storage, the directory state machine and the network are collaborators
//! behind the [`LogStore`], [`StateMachine`] and [`RaftTransport`] traits.
//! In-memory and in-process implementations are provided for tests and
//! simulation.

pub mod raft;

pub use raft::commit::{CommitContext, PendingWrite, QuorumWrite};
pub use raft::log::{LogEntry, LogOperation, RequestCode};
pub use raft::node::{Collaborators, PeerStatus, RaftNode, RaftStatus};
pub use raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AppendStatus, RequestVoteRequest,
    RequestVoteResponse, VoteStatus,
};
pub use raft::state::{ProxyState, Role};
pub use raft::state_machine::{DirectoryStateMachine, StateMachine};
pub use raft::store::{LogStore, MemoryStore, PersistedVar, PersistentState, StoreTxn};
pub use raft::transport::{LocalNetwork, LocalTransport, RaftService, RaftTransport};
