use super::log::{LogEntry, LogOperation, RequestCode};
use super::node::RaftCore;
use super::signal::{WaitOutcome, Wake};
use super::state::{RaftState, ReplCmd, Role};
use super::store::{PersistedVar, StoreTxn};
use parking_lot::MutexGuard;
use quorum_common::metrics::{COMMIT_INDEX, COMMIT_STEP_DOWN};
use quorum_common::types::{LogIndex, Term};
use quorum_common::{QuorumError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Watermarks {
    last_log_index: LogIndex,
    last_log_term: Term,
    commit_index: LogIndex,
    commit_index_term: Term,
    last_applied: LogIndex,
}

impl Watermarks {
    fn of(st: &RaftState) -> Self {
        Self {
            last_log_index: st.last_log_index,
            last_log_term: st.last_log_term,
            commit_index: st.commit_index,
            commit_index_term: st.commit_index_term,
            last_applied: st.last_applied,
        }
    }

    fn restore(&self, st: &mut RaftState) {
        st.last_log_index = self.last_log_index;
        st.last_log_term = self.last_log_term;
        st.commit_index = self.commit_index;
        st.commit_index_term = self.commit_index_term;
        st.last_applied = self.last_applied;
    }
}

/// An entry that reached consensus but whose local transaction has not
/// finished yet. Holds the state lock so no role change can slip in between.
/// Consumed by [`post_commit`](Self::post_commit) or
/// [`commit_fail`](Self::commit_fail); dropping it counts as a failure.
pub struct CommitContext<'a> {
    core: &'a RaftCore,
    guard: Option<MutexGuard<'a, RaftState>>,
    log_index: LogIndex,
    log_term: Term,
    request_code: RequestCode,
    prior: Watermarks,
}

impl CommitContext<'_> {
    /// The local transaction committed.
    pub fn post_commit(mut self) {
        if self.guard.take().is_some() {
            debug!(node = %self.core.id, index = self.log_index, term = self.log_term, code = ?self.request_code, "log committed");
        }
    }

    /// The local transaction failed after consensus: our state no longer
    /// matches what the peers hold, so give up leadership.
    pub fn commit_fail(mut self) {
        self.fail();
    }

    fn fail(&mut self) {
        if let Some(mut st) = self.guard.take() {
            warn!(node = %self.core.id, index = self.log_index, term = self.log_term, "local commit failed, stepping down");
            self.prior.restore(&mut st);
            st.cmd = ReplCmd::None;
            st.pending_entry = None;
            self.core.step_down_locked(&mut st);
            st.reset_ping();
        }
    }
}

impl Drop for CommitContext<'_> {
    fn drop(&mut self) {
        self.fail();
    }
}

/// First phase of a replicated write: the entry is allocated, its effects
/// and the log record are staged in an open store transaction.
pub struct PendingWrite<'a> {
    core: &'a RaftCore,
    txn: Box<dyn StoreTxn + 'a>,
    entry: LogEntry,
}

impl<'a> PendingWrite<'a> {
    pub fn entry(&self) -> &LogEntry {
        &self.entry
    }

    /// Blocks until a quorum holds the entry. On error the transaction is
    /// aborted.
    pub fn wait_for_quorum(self) -> Result<QuorumWrite<'a>> {
        let PendingWrite { core, txn, entry } = self;
        let ctx = core.prepare_commit(Some(&entry))?;
        Ok(QuorumWrite {
            txn,
            ctx,
            index: entry.index,
        })
    }

    pub fn abort(self) {
        self.txn.abort();
    }
}

/// Second phase: consensus is reached, the caller decides the local outcome.
/// The node's state stays locked until `commit` or `abort`.
pub struct QuorumWrite<'a> {
    txn: Box<dyn StoreTxn + 'a>,
    ctx: Option<CommitContext<'a>>,
    index: LogIndex,
}

impl QuorumWrite<'_> {
    pub fn index(&self) -> LogIndex {
        self.index
    }

    pub fn commit(self) -> Result<LogIndex> {
        let QuorumWrite { txn, ctx, index } = self;
        let committed = txn.commit();
        RaftCore::complete(ctx, committed)?;
        Ok(index)
    }

    pub fn abort(self) {
        let QuorumWrite { txn, ctx, .. } = self;
        txn.abort();
        if let Some(ctx) = ctx {
            ctx.commit_fail();
        }
    }
}

impl RaftCore {
    pub(crate) fn check_write_allowed(&self, st: &RaftState) -> Result<()> {
        if st.shutdown {
            return Err(QuorumError::Shutdown);
        }
        if st.cluster_size() < 2 || st.quorum_override {
            return Ok(());
        }
        if st.role != Role::Leader {
            return Err(QuorumError::NotLeader {
                leader: st.leader.clone(),
            });
        }
        if st.disallow_updates {
            return Err(QuorumError::UnwillingToPerform(
                "leadership transition in progress".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn begin_replicated_write(&self, ops: Vec<LogOperation>) -> Result<PendingWrite<'_>> {
        let mut txn = self.store.begin_write()?;
        let entry = {
            let st = self.state.lock();
            self.check_write_allowed(&st)?;
            LogEntry::from_operations(st.last_log_index + 1, st.current_term, ops)?
        };
        for op in entry.operations()? {
            self.state_machine.apply(txn.as_mut(), &op)?;
        }
        txn.append_log(&entry)?;
        txn.persist(PersistedVar::LastApplied(entry.index))?;
        debug!(node = %self.id, index = entry.index, term = entry.term, code = ?entry.request_code, "replicated write staged");
        Ok(PendingWrite {
            core: self,
            txn,
            entry,
        })
    }

    /// Blocks until `entry` is held by a quorum, then returns with the state
    /// lock held. `None` means there is nothing to replicate.
    pub(crate) fn prepare_commit(&self, entry: Option<&LogEntry>) -> Result<Option<CommitContext<'_>>> {
        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut st = self.state.lock();
        let prior = Watermarks::of(&st);
        if entry.index != st.last_log_index + 1 {
            return Err(QuorumError::LogConsistency(format!(
                "log {} does not follow last log {}",
                entry.index, st.last_log_index
            )));
        }

        if !(st.quorum_override || st.cluster_size() < 2) {
            let timeout = if entry.is_no_op() {
                self.config.noop_commit_timeout()
            } else {
                self.config.election_timeout()
            };
            let reached = self.await_consensus(&mut st, entry, timeout);
            st.cmd = ReplCmd::None;
            st.pending_entry = None;
            reached?;
        }

        st.last_log_index = entry.index;
        st.last_log_term = entry.term;
        st.commit_index = entry.index;
        st.commit_index_term = entry.term;
        if !entry.is_no_op() {
            st.last_applied = entry.index;
        }
        st.index_to_apply = st.commit_index;
        st.op_counts += 1;
        self.metrics.observe_gauge(COMMIT_INDEX, entry.index as f64);

        Ok(Some(CommitContext {
            core: self,
            guard: Some(st),
            log_index: entry.index,
            log_term: entry.term,
            request_code: entry.request_code,
            prior,
        }))
    }

    /// Finishes a consensus-gated transaction with its local outcome.
    pub(crate) fn complete(ctx: Option<CommitContext<'_>>, committed: Result<()>) -> Result<()> {
        match (ctx, committed) {
            (Some(ctx), Ok(())) => {
                ctx.post_commit();
                Ok(())
            }
            (Some(ctx), Err(e)) => {
                ctx.commit_fail();
                Err(e)
            }
            (None, result) => result,
        }
    }

    fn await_consensus(
        &self,
        st: &mut MutexGuard<'_, RaftState>,
        entry: &LogEntry,
        timeout: Duration,
    ) -> Result<()> {
        let rounds = self.config.consensus_retry_limit.max(1);
        for round in 1..=rounds {
            let deadline = Instant::now() + timeout;
            if self.wait_peers_ready(st, entry, deadline)? {
                st.cmd = ReplCmd::AppendEntries;
                st.pending_entry = Some(entry.clone());
                st.clear_replicated();
                self.signals.clear(st, Wake::AppendConsensus);
                self.signals.broadcast_request(st);

                loop {
                    self.ensure_leader(st, entry)?;
                    if st.has_append_consensus() {
                        debug!(node = %self.id, index = entry.index, acks = st.append_consensus_count(), "consensus reached");
                        return Ok(());
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    if self.signals.wait(st, Wake::AppendConsensus, deadline - now)
                        == WaitOutcome::Shutdown
                    {
                        return Err(QuorumError::Shutdown);
                    }
                }
            }
            warn!(
                node = %self.id,
                index = entry.index,
                round,
                acks = st.append_consensus_count(),
                cluster_size = st.cluster_size(),
                "no consensus for log entry"
            );
        }

        info!(node = %self.id, index = entry.index, rounds, "giving up leadership after failed consensus");
        self.metrics.inc_counter(COMMIT_STEP_DOWN);
        self.step_down_locked(st);
        st.reset_ping();
        Err(QuorumError::UnwillingToPerform(format!(
            "no consensus for log {} after {} rounds",
            entry.index, rounds
        )))
    }

    /// Returns false when the deadline passes before enough peers are idle.
    fn wait_peers_ready(
        &self,
        st: &mut MutexGuard<'_, RaftState>,
        entry: &LogEntry,
        deadline: Instant,
    ) -> Result<bool> {
        loop {
            self.ensure_leader(st, entry)?;
            if st.peers_idle() >= st.cluster_size() / 2 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if self.signals.wait(st, Wake::PeersReady, deadline - now) == WaitOutcome::Shutdown {
                return Err(QuorumError::Shutdown);
            }
        }
    }

    fn ensure_leader(&self, st: &RaftState, entry: &LogEntry) -> Result<()> {
        if st.shutdown {
            return Err(QuorumError::Shutdown);
        }
        if st.role != Role::Leader || st.current_term != entry.term {
            return Err(QuorumError::UnwillingToPerform(format!(
                "leadership lost while replicating log {} (role {:?}, term {})",
                entry.index, st.role, st.current_term
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state::ProxyState;
    use crate::raft::state_machine::DirectoryStateMachine;
    use crate::raft::store::{LogStore, MemoryStore};
    use crate::raft::testing::{connect_all, open_cluster, open_core};
    use crate::raft::transport::LocalNetwork;
    use std::sync::Arc;

    fn standalone() -> (Arc<RaftCore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let core = open_core("solo", &["solo"], Arc::clone(&store), &LocalNetwork::new());
        (core, store)
    }

    #[test]
    fn test_nothing_to_commit() {
        let (core, _store) = standalone();
        assert!(core.prepare_commit(None).unwrap().is_none());
    }

    #[test]
    fn test_standalone_write_commits_immediately() {
        let (core, store) = standalone();
        let write = core
            .begin_replicated_write(vec![LogOperation::add(1, "cn=a"), LogOperation::add(2, "cn=b")])
            .unwrap();
        assert_eq!(write.entry().request_code, RequestCode::MultiLog);
        let index = write.wait_for_quorum().unwrap().commit().unwrap();

        assert_eq!(index, 1);
        let st = core.state.lock();
        assert_eq!((st.last_log_index, st.commit_index, st.last_applied), (1, 1, 1));
        assert!(st.check_invariants().is_ok());
        drop(st);
        assert_eq!(store.data().len(), 2);
        assert_eq!(store.state().last_applied, 1);
    }

    #[test]
    fn test_failed_local_commit_restores_state() {
        let (core, store) = standalone();
        store.fail_next_commits(1);
        let write = core.begin_replicated_write(vec![LogOperation::add(1, "cn=a")]).unwrap();
        let err = write.wait_for_quorum().unwrap().commit().unwrap_err();
        assert!(matches!(err, QuorumError::Persistence(_)));

        let st = core.state.lock();
        assert_eq!((st.last_log_index, st.commit_index, st.last_applied), (0, 0, 0));
        drop(st);
        assert!(store.entries().is_empty());
        assert!(DirectoryStateMachine::read(&*store, 1).unwrap().is_none());

        // The index is free again for the next write.
        assert_eq!(core.begin_replicated_write(vec![LogOperation::add(1, "cn=a")]).unwrap().entry().index, 1);
    }

    #[test]
    fn test_dropped_context_behaves_as_failure() {
        let (core, store) = standalone();
        {
            let write = core.begin_replicated_write(vec![LogOperation::add(1, "cn=a")]).unwrap();
            let quorum = write.wait_for_quorum().unwrap();
            assert_eq!(quorum.index(), 1);
        }
        assert_eq!(core.state.lock().last_log_index, 0);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_rejects_out_of_order_entry() {
        let (core, _store) = standalone();
        let err = core.prepare_commit(Some(&LogEntry::no_op(3, 1))).err().unwrap();
        assert!(matches!(err, QuorumError::LogConsistency(_)));
    }

    #[test]
    fn test_follower_refers_to_leader() {
        let core = open_core("n2", &["n1", "n2", "n3"], Arc::new(MemoryStore::new()), &LocalNetwork::new());
        core.state.lock().leader = Some("n1".into());
        match core.begin_replicated_write(vec![LogOperation::add(1, "x")]) {
            Err(QuorumError::NotLeader { leader }) => assert_eq!(leader.as_deref(), Some("n1")),
            _ => panic!("expected a referral"),
        };
    }

    #[test]
    fn test_transition_window_rejects_writes() {
        let core = open_core("n1", &["n1", "n2", "n3"], Arc::new(MemoryStore::new()), &LocalNetwork::new());
        {
            let mut st = core.state.lock();
            st.role = Role::Leader;
            st.disallow_updates = true;
        }
        assert!(matches!(
            core.begin_replicated_write(vec![LogOperation::add(1, "x")]),
            Err(QuorumError::UnwillingToPerform(_))
        ));
    }

    #[test]
    fn test_quorum_override_skips_consensus() {
        let store = Arc::new(MemoryStore::new());
        let core = open_core("n1", &["n1", "n2", "n3"], Arc::clone(&store), &LocalNetwork::new());
        core.state.lock().quorum_override = true;

        let index = core
            .begin_replicated_write(vec![LogOperation::add(1, "x")])
            .unwrap()
            .wait_for_quorum()
            .unwrap()
            .commit()
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_leader_steps_down_without_quorum() {
        let (cores, stores, network) = open_cluster(&["n1", "n2", "n3", "n4", "n5"]);
        for core in &cores {
            connect_all(core);
        }
        let leader = &cores[0];
        {
            let mut st = leader.state.lock();
            st.current_term = 2;
            st.role = Role::Leader;
            st.leader = Some("n1".into());
            // Two followers unreachable, one that never answers.
            st.peers.get_mut("n4").unwrap().state = ProxyState::Disconnected;
            st.peers.get_mut("n5").unwrap().state = ProxyState::Disconnected;
        }
        network.set_unresponsive("n3", true);

        // Only n2 acknowledges.
        let n2_epoch = leader.state.lock().peers["n2"].epoch;
        let acker = {
            let leader = Arc::clone(leader);
            std::thread::spawn(move || {
                let driver = crate::raft::replication::PeerDriver::new("n2".into(), n2_epoch);
                for _ in 0..200 {
                    let _ = leader.append_entries_rpc(&driver, crate::raft::replication::AppendKind::Append);
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let err = leader
            .begin_replicated_write(vec![LogOperation::add(5, "x")])
            .unwrap()
            .wait_for_quorum()
            .err()
            .unwrap();
        assert!(err.is_unwilling());

        let st = leader.state.lock();
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.last_log_index, 0);
        assert!(st.pending_entry.is_none());
        drop(st);
        acker.join().unwrap();
        assert!(stores[0].entries().is_empty());
    }
}
