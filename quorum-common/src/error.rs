use crate::types::{LogIndex, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// Role changed or this node cannot take the request right now.
    #[error("Unwilling to perform: {0}")]
    UnwillingToPerform(String),

    #[error("Not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("Peer {0} is disconnected")]
    Disconnected(NodeId),

    #[error("RPC Error: {0}")]
    Rpc(String),

    #[error("Log entry {0} is missing")]
    LogMissing(LogIndex),

    #[error("Log entry {0} already exists")]
    LogConflict(LogIndex),

    #[error("Log consistency violation: {0}")]
    LogConsistency(String),

    #[error("Persistence Error: {0}")]
    Persistence(String),

    #[error("State machine Error: {0}")]
    StateMachine(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Node is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, QuorumError>;

impl QuorumError {
    /// Transport failures that should mark a peer disconnected and trigger a reconnect.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, QuorumError::Disconnected(_) | QuorumError::Io(_))
    }

    pub fn is_unwilling(&self) -> bool {
        matches!(
            self,
            QuorumError::UnwillingToPerform(_) | QuorumError::NotLeader { .. }
        )
    }
}

impl From<bincode::Error> for QuorumError {
    fn from(err: bincode::Error) -> Self {
        QuorumError::Codec(format!("Bincode Error: {}", err))
    }
}
