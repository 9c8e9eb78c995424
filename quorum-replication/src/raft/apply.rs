use super::node::RaftCore;
use super::signal::{WaitOutcome, Wake};
use super::state::Role;
use super::store::PersistedVar;
use quorum_common::types::LogIndex;
use quorum_common::{QuorumError, Result};
use tracing::{debug, error, trace};

impl RaftCore {
    /// Follower side: applies entries as the leader's commit index advances.
    pub(crate) fn run_apply_loop(&self) {
        loop {
            let target = {
                let mut st = self.state.lock();
                if self.signals.wait(&mut st, Wake::NewLog, self.config.apply_poll())
                    == WaitOutcome::Shutdown
                {
                    break;
                }
                if st.role != Role::Follower || st.index_to_apply <= st.last_applied {
                    continue;
                }
                st.index_to_apply
            };
            if let Err(e) = self.apply_logs_upto(target) {
                error!(node = %self.id, target, error = %e, "failed to apply committed logs");
            }
        }
        debug!(node = %self.id, "log applier stopped");
    }

    pub(crate) fn apply_logs_upto(&self, target: LogIndex) -> Result<()> {
        let from = self.state.lock().last_applied + 1;
        self.apply_logs_range(from, target)
    }

    pub(crate) fn apply_logs_range(&self, from: LogIndex, to: LogIndex) -> Result<()> {
        if from > to {
            return Ok(());
        }
        debug!(node = %self.id, from, to, "applying logs");
        for index in from.max(1)..=to {
            if self.state.lock().shutdown {
                return Err(QuorumError::Shutdown);
            }
            self.apply_log(index)?;
        }
        Ok(())
    }

    /// Applies one entry together with the `LastApplied` marker, so a crash
    /// never leaves an operation applied twice.
    fn apply_log(&self, index: LogIndex) -> Result<()> {
        let mut txn = self.store.begin_write()?;
        if txn.last_applied()? >= index {
            txn.abort();
            trace!(node = %self.id, index, "already applied");
            return Ok(());
        }
        let entry = self
            .store
            .read_log(index)?
            .ok_or(QuorumError::LogMissing(index))?;
        for op in entry.operations()? {
            self.state_machine.apply(txn.as_mut(), &op)?;
        }
        txn.persist(PersistedVar::LastApplied(index))?;
        txn.commit()?;

        self.state.lock().advance_applied(index, entry.term);
        trace!(node = %self.id, index, term = entry.term, code = ?entry.request_code, "log applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::raft::log::{LogEntry, LogOperation};
    use crate::raft::state_machine::DirectoryStateMachine;
    use crate::raft::store::{LogStore, MemoryStore};
    use crate::raft::testing::open_core;
    use crate::raft::transport::LocalNetwork;
    use quorum_common::QuorumError;
    use std::sync::Arc;

    fn seed(store: &MemoryStore, entries: &[LogEntry]) {
        let mut txn = store.begin_write().unwrap();
        for entry in entries {
            txn.append_log(entry).unwrap();
        }
        txn.commit().unwrap();
    }

    fn follower() -> (Arc<crate::raft::node::RaftCore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let core = open_core("n2", &["n1", "n2", "n3"], Arc::clone(&store), &LocalNetwork::new());
        (core, store)
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (core, store) = follower();
        seed(
            &store,
            &[
                LogEntry::no_op(1, 1),
                LogEntry::from_operations(2, 1, vec![LogOperation::add(7, "cn=seven")]).unwrap(),
            ],
        );

        core.apply_logs_upto(2).unwrap();
        assert_eq!(store.state().last_applied, 2);
        assert_eq!(core.state.lock().last_applied, 2);

        // A second pass must not re-run the Add, which would now fail.
        core.apply_logs_range(1, 2).unwrap();
        assert_eq!(
            DirectoryStateMachine::read(&*store, 7).unwrap().as_deref(),
            Some(&b"cn=seven"[..])
        );
    }

    #[test]
    fn test_batch_applies_in_order() {
        let (core, store) = follower();
        let ops = vec![
            LogOperation::add(1, "cn=a"),
            LogOperation::modify(1, "cn=b"),
            LogOperation::add(2, "cn=c"),
            LogOperation::delete(2),
        ];
        seed(&store, &[LogEntry::from_operations(1, 1, ops).unwrap()]);

        core.apply_logs_upto(1).unwrap();
        let data = store.data();
        assert_eq!(data.len(), 1);
        assert_eq!(
            DirectoryStateMachine::read(&*store, 1).unwrap().as_deref(),
            Some(&b"cn=b"[..])
        );
    }

    #[test]
    fn test_missing_entry_stops_apply() {
        let (core, store) = follower();
        seed(&store, &[LogEntry::no_op(1, 1)]);

        let err = core.apply_logs_upto(2).unwrap_err();
        assert!(matches!(err, QuorumError::LogMissing(2)));
        assert_eq!(core.state.lock().last_applied, 1);
    }

    #[test]
    fn test_failed_operation_leaves_marker_untouched() {
        let (core, store) = follower();
        seed(
            &store,
            &[LogEntry::from_operations(1, 1, vec![LogOperation::delete(9)]).unwrap()],
        );

        assert!(core.apply_logs_upto(1).is_err());
        assert_eq!(store.state().last_applied, 0);
        assert_eq!(core.state.lock().last_applied, 0);
    }
}
