use super::node::RaftCore;
use super::signal::WaitOutcome;
use super::state::RaftState;
use super::store::PersistedVar;
use quorum_common::metrics::LOGS_COMPACTED;
use quorum_common::types::LogIndex;
use quorum_common::{QuorumError, Result};
use tracing::{debug, info, warn};

impl RaftCore {
    pub(crate) fn run_compact_loop(&self) {
        loop {
            {
                let mut st = self.state.lock();
                if self.signals.pause(&mut st, self.config.compact_interval()) == WaitOutcome::Shutdown {
                    break;
                }
                if !self.compaction_due(&mut st) {
                    continue;
                }
            }
            if let Err(e) = self.compact_logs() {
                warn!(node = %self.id, error = %e, "log compaction failed");
            }
        }
        debug!(node = %self.id, "log compactor stopped");
    }

    /// Light surpluses wait for a quiet period; a surplus of twice the
    /// retention is compacted regardless of write traffic.
    fn compaction_due(&self, st: &mut RaftState) -> bool {
        let keep = self.config.keep_logs;
        let surplus = st.commit_index.saturating_sub(st.first_log_index);
        if surplus <= keep {
            return false;
        }
        if st.op_counts > 0 && surplus < 2 * keep {
            st.op_counts = 0;
            return false;
        }
        true
    }

    /// Deletes applied entries more than `keep_logs` behind the commit index,
    /// one batch per transaction. Returns the new first log index.
    pub(crate) fn compact_logs(&self) -> Result<LogIndex> {
        let keep = self.config.keep_logs;
        let start = self.state.lock().first_log_index;
        loop {
            let mut txn = self.store.begin_write()?;
            let (first, upto, last_batch) = {
                let st = self.state.lock();
                if st.shutdown {
                    return Err(QuorumError::Shutdown);
                }
                let removable = |idx: LogIndex| {
                    idx < st.commit_index && st.commit_index - idx > keep && idx <= st.last_applied
                };
                let first = st.first_log_index;
                let mut idx = first;
                while idx - first < self.config.compact_batch && removable(idx) {
                    idx += 1;
                }
                (first, idx, !removable(idx))
            };
            if upto == first {
                txn.abort();
                break;
            }

            for index in first..upto {
                txn.delete_log(index)?;
            }
            let persist = {
                let st = self.state.lock();
                last_batch
                    || st.compacted_since_persist + (upto - first) >= self.config.first_log_persist_every
            };
            if persist {
                txn.persist(PersistedVar::FirstLogIndex(upto))?;
            }
            txn.commit()?;

            let mut st = self.state.lock();
            st.first_log_index = upto;
            if persist {
                st.compacted_since_persist = 0;
            } else {
                st.compacted_since_persist += upto - first;
            }
            debug!(node = %self.id, from = first, to = upto - 1, "compacted logs");
            if last_batch {
                break;
            }
        }

        let mut st = self.state.lock();
        st.op_counts = 0;
        let end = st.first_log_index;
        drop(st);
        if end > start {
            self.metrics.inc_counter(LOGS_COMPACTED);
            info!(node = %self.id, removed = end - start, first_log_index = end, "log compaction finished");
        }
        Ok(end)
    }
}
