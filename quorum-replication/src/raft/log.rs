use bytes::Bytes;
use quorum_common::types::{EntryId, LogIndex, Term};
use quorum_common::{QuorumError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a log entry does to the directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestCode {
    NoOp,     // Leadership marker, touches no data
    Add,      // Create an entry
    Modify,   // Replace an entry
    Delete,   // Remove an entry
    MultiLog, // Ordered batch of Add/Modify/Delete applied together
}

impl RequestCode {
    pub fn is_mutation(self) -> bool {
        matches!(self, RequestCode::Add | RequestCode::Modify | RequestCode::Delete)
    }
}

/// One decoded directory mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogOperation {
    pub entry_id: EntryId,
    pub request_code: RequestCode,
    pub payload: Bytes,
}

impl LogOperation {
    pub fn add(entry_id: EntryId, payload: impl Into<Bytes>) -> Self {
        Self {
            entry_id,
            request_code: RequestCode::Add,
            payload: payload.into(),
        }
    }

    pub fn modify(entry_id: EntryId, payload: impl Into<Bytes>) -> Self {
        Self {
            entry_id,
            request_code: RequestCode::Modify,
            payload: payload.into(),
        }
    }

    pub fn delete(entry_id: EntryId) -> Self {
        Self {
            entry_id,
            request_code: RequestCode::Delete,
            payload: Bytes::new(),
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub index: LogIndex,           // Position in the log, never reused
    pub term: Term,                // Term in which the leader created the entry
    pub entry_id: EntryId,         // Directory entry id, 0 for no-op and batches
    pub request_code: RequestCode, // How to interpret the payload
    pub payload: Bytes,            // Encoded change
}

impl LogEntry {
    pub fn no_op(index: LogIndex, term: Term) -> Self {
        Self {
            index,
            term,
            entry_id: 0,
            request_code: RequestCode::NoOp,
            payload: Bytes::new(),
        }
    }

    /// Packs operations into one entry. A single operation is stored as-is,
    /// several become a `MultiLog` batch.
    pub fn from_operations(index: LogIndex, term: Term, mut ops: Vec<LogOperation>) -> Result<Self> {
        if let Some(op) = ops.iter().find(|op| !op.request_code.is_mutation()) {
            return Err(QuorumError::InvalidRequest(format!(
                "{:?} cannot be submitted as an operation",
                op.request_code
            )));
        }

        match ops.len() {
            0 => Err(QuorumError::InvalidRequest("no operations to replicate".into())),
            1 => {
                let op = ops.remove(0);
                Ok(Self {
                    index,
                    term,
                    entry_id: op.entry_id,
                    request_code: op.request_code,
                    payload: op.payload,
                })
            }
            _ => Ok(Self {
                index,
                term,
                entry_id: 0,
                request_code: RequestCode::MultiLog,
                payload: bincode::serialize(&ops)?.into(),
            }),
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.request_code == RequestCode::NoOp
    }

    /// Decodes the entry into the ordered operations it carries.
    pub fn operations(&self) -> Result<Vec<LogOperation>> {
        match self.request_code {
            RequestCode::NoOp => Ok(Vec::new()),
            RequestCode::MultiLog => {
                let ops: Vec<LogOperation> = bincode::deserialize(&self.payload)?;
                if ops.iter().any(|op| !op.request_code.is_mutation()) {
                    return Err(QuorumError::Codec(format!(
                        "log {} carries a nested batch or no-op",
                        self.index
                    )));
                }
                Ok(ops)
            }
            code => Ok(vec![LogOperation {
                entry_id: self.entry_id,
                request_code: code,
                payload: self.payload.clone(),
            }]),
        }
    }
}

/// Ordered in-memory log keyed by Raft index
#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: BTreeMap<LogIndex, LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. An index that is already taken is a conflict.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if self.entries.contains_key(&entry.index) {
            return Err(QuorumError::LogConflict(entry.index));
        }
        self.entries.insert(entry.index, entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.entries.get(&index)
    }

    pub fn remove(&mut self, index: LogIndex) -> Option<LogEntry> {
        self.entries.remove(&index)
    }

    pub fn first(&self) -> Option<&LogEntry> {
        self.entries.values().next()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.values().next_back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }
}
