use super::log::{LogOperation, RequestCode};
use super::store::{LogStore, StoreTxn};
use bytes::Bytes;
use quorum_common::types::EntryId;
use quorum_common::{QuorumError, Result};

/// Applies decoded directory operations inside the caller's store
/// transaction, so the data change and the `last_applied` watermark commit
/// together.
pub trait StateMachine: Send + Sync {
    fn apply_add(&self, txn: &mut dyn StoreTxn, op: &LogOperation) -> Result<()>;
    fn apply_modify(&self, txn: &mut dyn StoreTxn, op: &LogOperation) -> Result<()>;
    fn apply_delete(&self, txn: &mut dyn StoreTxn, op: &LogOperation) -> Result<()>;

    fn apply(&self, txn: &mut dyn StoreTxn, op: &LogOperation) -> Result<()> {
        match op.request_code {
            RequestCode::Add => self.apply_add(txn, op),
            RequestCode::Modify => self.apply_modify(txn, op),
            RequestCode::Delete => self.apply_delete(txn, op),
            code => Err(QuorumError::StateMachine(format!(
                "{:?} is not a directory operation",
                code
            ))),
        }
    }
}

/// Minimal directory: one opaque value per entry id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryStateMachine;

impl DirectoryStateMachine {
    pub fn entry_key(entry_id: EntryId) -> String {
        format!("entry/{}", entry_id)
    }

    /// Reads a committed entry.
    pub fn read(store: &dyn LogStore, entry_id: EntryId) -> Result<Option<Bytes>> {
        store.get(&Self::entry_key(entry_id))
    }
}

impl StateMachine for DirectoryStateMachine {
    fn apply_add(&self, txn: &mut dyn StoreTxn, op: &LogOperation) -> Result<()> {
        let key = Self::entry_key(op.entry_id);
        if txn.get(&key)?.is_some() {
            return Err(QuorumError::StateMachine(format!(
                "entry {} already exists",
                op.entry_id
            )));
        }
        txn.put(&key, op.payload.clone())
    }

    fn apply_modify(&self, txn: &mut dyn StoreTxn, op: &LogOperation) -> Result<()> {
        let key = Self::entry_key(op.entry_id);
        if txn.get(&key)?.is_none() {
            return Err(QuorumError::StateMachine(format!(
                "no such entry {}",
                op.entry_id
            )));
        }
        txn.put(&key, op.payload.clone())
    }

    fn apply_delete(&self, txn: &mut dyn StoreTxn, op: &LogOperation) -> Result<()> {
        if !txn.remove(&Self::entry_key(op.entry_id))? {
            return Err(QuorumError::StateMachine(format!(
                "no such entry {}",
                op.entry_id
            )));
        }
        Ok(())
    }
}
