use super::log::{LogEntry, RaftLog};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use quorum_common::types::{LogIndex, NodeId, Term};
use quorum_common::{QuorumError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Raft variables that must survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub voted_for_term: Term,
    pub first_log_index: LogIndex,
    pub last_applied: LogIndex,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            voted_for_term: 0,
            first_log_index: 1,
            last_applied: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedVar {
    Term(Term),
    Vote { term: Term, candidate: NodeId },
    FirstLogIndex(LogIndex),
    LastApplied(LogIndex),
}

impl PersistentState {
    pub fn apply(&mut self, var: PersistedVar) {
        match var {
            PersistedVar::Term(term) => self.current_term = term,
            PersistedVar::Vote { term, candidate } => {
                self.voted_for = Some(candidate);
                self.voted_for_term = term;
            }
            PersistedVar::FirstLogIndex(index) => self.first_log_index = index,
            PersistedVar::LastApplied(index) => self.last_applied = index,
        }
    }
}

/// A write transaction on the local store. Dropping it without `commit` aborts.
pub trait StoreTxn {
    /// Fails with `LogConflict` if the index is already present.
    fn append_log(&mut self, entry: &LogEntry) -> Result<()>;
    /// Returns whether an entry was found.
    fn delete_log(&mut self, index: LogIndex) -> Result<bool>;
    fn persist(&mut self, var: PersistedVar) -> Result<()>;
    /// `last_applied` as seen inside this transaction.
    fn last_applied(&self) -> Result<LogIndex>;

    fn get(&self, key: &str) -> Result<Option<Bytes>>;
    fn put(&mut self, key: &str, value: Bytes) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<bool>;

    fn commit(self: Box<Self>) -> Result<()>;
    fn abort(self: Box<Self>);
}

/// Transactional storage for the replicated log, the persisted Raft
/// variables and the directory data they protect.
pub trait LogStore: Send + Sync {
    /// Opens the single write transaction. Blocks while another is open.
    fn begin_write(&self) -> Result<Box<dyn StoreTxn + '_>>;

    fn read_log(&self, index: LogIndex) -> Result<Option<LogEntry>>;
    fn first_log(&self) -> Result<Option<LogEntry>>;
    fn last_log(&self) -> Result<Option<LogEntry>>;
    fn load_state(&self) -> Result<PersistentState>;
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Writes variables in a transaction of their own.
    fn persist(&self, vars: &[PersistedVar]) -> Result<()> {
        let mut txn = self.begin_write()?;
        for var in vars {
            txn.persist(var.clone())?;
        }
        txn.commit()
    }
}

#[derive(Debug, Default)]
struct Contents {
    log: RaftLog,
    state: PersistentState,
    data: BTreeMap<String, Bytes>,
}

/// In-memory `LogStore`. Writers are serialized and see their own staged
/// changes; readers only see committed data.
#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: Mutex<Contents>,
    writer: Mutex<()>,
    failing_commits: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail as if the disk were full.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Committed log entries in index order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.committed.lock().log.iter().cloned().collect()
    }

    pub fn state(&self) -> PersistentState {
        self.committed.lock().state.clone()
    }

    pub fn data(&self) -> BTreeMap<String, Bytes> {
        self.committed.lock().data.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl LogStore for MemoryStore {
    fn begin_write(&self) -> Result<Box<dyn StoreTxn + '_>> {
        let writer = self.writer.lock();
        let state = self.committed.lock().state.clone();
        Ok(Box::new(MemoryTxn {
            store: self,
            _writer: writer,
            state,
            log: BTreeMap::new(),
            data: BTreeMap::new(),
        }))
    }

    fn read_log(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.committed.lock().log.get(index).cloned())
    }

    fn first_log(&self) -> Result<Option<LogEntry>> {
        Ok(self.committed.lock().log.first().cloned())
    }

    fn last_log(&self) -> Result<Option<LogEntry>> {
        Ok(self.committed.lock().log.last().cloned())
    }

    fn load_state(&self) -> Result<PersistentState> {
        Ok(self.committed.lock().state.clone())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.committed.lock().data.get(key).cloned())
    }
}

/// Staged changes over the committed contents. `None` marks a removal.
struct MemoryTxn<'a> {
    store: &'a MemoryStore,
    _writer: MutexGuard<'a, ()>,
    state: PersistentState,
    log: BTreeMap<LogIndex, Option<LogEntry>>,
    data: BTreeMap<String, Option<Bytes>>,
}

impl MemoryTxn<'_> {
    fn holds_log(&self, index: LogIndex) -> bool {
        match self.log.get(&index) {
            Some(staged) => staged.is_some(),
            None => self.store.committed.lock().log.get(index).is_some(),
        }
    }
}

impl StoreTxn for MemoryTxn<'_> {
    fn append_log(&mut self, entry: &LogEntry) -> Result<()> {
        if self.holds_log(entry.index) {
            return Err(QuorumError::LogConflict(entry.index));
        }
        self.log.insert(entry.index, Some(entry.clone()));
        Ok(())
    }

    fn delete_log(&mut self, index: LogIndex) -> Result<bool> {
        if !self.holds_log(index) {
            return Ok(false);
        }
        self.log.insert(index, None);
        Ok(true)
    }

    fn persist(&mut self, var: PersistedVar) -> Result<()> {
        self.state.apply(var);
        Ok(())
    }

    fn last_applied(&self) -> Result<LogIndex> {
        Ok(self.state.last_applied)
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.data.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.store.committed.lock().data.get(key).cloned()),
        }
    }

    fn put(&mut self, key: &str, value: Bytes) -> Result<()> {
        self.data.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let present = self.get(key)?.is_some();
        if present {
            self.data.insert(key.to_string(), None);
        }
        Ok(present)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        if self.store.take_injected_failure() {
            return Err(QuorumError::Persistence("injected commit failure".into()));
        }
        let MemoryTxn {
            store,
            state,
            log,
            data,
            ..
        } = *self;
        let mut committed = store.committed.lock();
        for (index, change) in log {
            committed.log.remove(index);
            if let Some(entry) = change {
                committed.log.append(entry)?;
            }
        }
        for (key, change) in data {
            match change {
                Some(value) => committed.data.insert(key, value),
                None => committed.data.remove(&key),
            };
        }
        committed.state = state;
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
