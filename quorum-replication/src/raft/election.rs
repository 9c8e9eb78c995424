use super::log::LogEntry;
use super::node::RaftCore;
use super::signal::{WaitOutcome, Wake};
use super::state::{RaftState, ReplCmd, Role};
use super::store::PersistedVar;
use quorum_common::metrics::{ELECTIONS_TRIGGERED, LEADER_ELECTED};
use quorum_common::types::{LogIndex, Term};
use quorum_common::Result;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of tallying a finished vote round.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum VoteOutcome {
    /// Lost the candidacy while the votes were out.
    NotCandidate,
    /// No majority. Try again after a short random pause.
    Retry,
    Elected { noop: LogEntry, apply_from: LogIndex },
}

/// Pure decision on the tally; performs the role change on a win.
pub(crate) fn decide_vote_outcome(st: &mut RaftState, term: Term) -> VoteOutcome {
    if st.role != Role::Candidate || st.current_term != term {
        return VoteOutcome::NotCandidate;
    }
    if !st.has_vote_majority() {
        return VoteOutcome::Retry;
    }
    let apply_from = st.last_applied + 1;
    let noop = st.become_leader();
    VoteOutcome::Elected { noop, apply_from }
}

impl RaftCore {
    pub(crate) fn run_election_loop(&self) {
        let mut wait = self.config.initial_election_wait();
        let mut st = self.state.lock();
        loop {
            if self.signals.wait(&mut st, Wake::VoteRequest, wait) == WaitOutcome::Shutdown {
                break;
            }
            wait = self.config.election_timeout();

            if st.cluster_size() < 2 {
                continue;
            }
            match st.role {
                Role::Leader => continue,
                Role::Follower => {
                    if let Some(elapsed) = st.ping_elapsed() {
                        if elapsed < self.config.election_timeout() {
                            wait = self.config.election_timeout() - elapsed;
                            continue;
                        }
                    }
                    info!(node = %self.id, term = st.current_term, leader = ?st.leader, "election timeout, becoming candidate");
                    st.role = Role::Candidate;
                    st.leader = None;
                }
                Role::Candidate => {
                    debug!(node = %self.id, term = st.current_term, "no leader yet, retrying election");
                }
            }
            self.metrics.inc_counter(ELECTIONS_TRIGGERED);
            drop(st);

            if let Some(backoff) = self.run_election_round() {
                wait = backoff;
            }
            st = self.state.lock();
        }
        debug!(node = %self.id, "election engine stopped");
    }

    /// One candidacy. Returns the pause before the next attempt, if it
    /// should come sooner than a full election timeout.
    fn run_election_round(&self) -> Option<Duration> {
        if !self.wait_for_voters() {
            return None;
        }

        let term = {
            let _reply = self.rpc_reply.lock();
            let term = {
                let mut st = self.state.lock();
                if st.role != Role::Candidate {
                    return None;
                }
                st.become_candidate()
            };
            let vars = [
                PersistedVar::Term(term),
                PersistedVar::Vote {
                    term,
                    candidate: self.id.clone(),
                },
            ];
            if self.persist_vars(&vars).is_err() {
                return None;
            }
            term
        };

        let mut st = self.state.lock();
        if st.current_term != term || st.role != Role::Candidate {
            debug!(node = %self.id, term, current = st.current_term, "term moved before votes went out");
            return None;
        }
        if st.voted_for.as_deref() != Some(self.id.as_str()) {
            self.step_down_locked(&mut st);
            return None;
        }

        info!(node = %self.id, term, last_log_index = st.last_log_index, last_log_term = st.last_log_term, "requesting votes");
        st.cmd = ReplCmd::RequestVote;
        self.signals.clear(&mut st, Wake::VoteResult);
        self.signals.broadcast_request(&mut st);
        let outcome = self.signals.wait(&mut st, Wake::VoteResult, self.config.election_timeout());
        if st.cmd == ReplCmd::RequestVote {
            st.cmd = ReplCmd::None;
        }
        if outcome == WaitOutcome::Shutdown {
            return None;
        }
        drop(st);

        self.evaluate_vote_result(term)
    }

    /// Waits until enough replication drivers are idle to canvass a majority.
    fn wait_for_voters(&self) -> bool {
        let deadline = Instant::now() + self.config.election_timeout();
        let mut st = self.state.lock();
        while st.peers_idle() < st.cluster_size() / 2 {
            if st.role != Role::Candidate || st.shutdown {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(node = %self.id, idle = st.peers_idle(), cluster_size = st.cluster_size(), "not enough peers reachable to campaign");
                return false;
            }
            let poll = self.config.ping_interval().min(deadline - now);
            if self.signals.wait(&mut st, Wake::PeersReady, poll) == WaitOutcome::Shutdown {
                return false;
            }
        }
        st.role == Role::Candidate
    }

    /// Settles the election under the RPC-reply lock so no inbound request
    /// interleaves with the leadership transition.
    fn evaluate_vote_result(&self, term: Term) -> Option<Duration> {
        let _reply = self.rpc_reply.lock();
        let outcome = {
            let mut st = self.state.lock();
            st.disallow_updates = true;
            decide_vote_outcome(&mut st, term)
        };

        let next = match outcome {
            VoteOutcome::NotCandidate => None,
            VoteOutcome::Retry => {
                let st = self.state.lock();
                info!(
                    node = %self.id,
                    term,
                    votes = st.vote_consensus_cnt,
                    denied = st.vote_denied_cnt,
                    cluster_size = st.cluster_size(),
                    "no majority"
                );
                Some(self.election_backoff())
            }
            VoteOutcome::Elected { noop, apply_from } => {
                info!(node = %self.id, term, "elected leader");
                self.metrics.inc_counter(LEADER_ELECTED);
                if let Err(e) = self.open_term(&noop, apply_from) {
                    warn!(node = %self.id, term, error = %e, "failed to commit leader no-op");
                    let mut st = self.state.lock();
                    self.step_down_locked(&mut st);
                    st.reset_ping();
                }
                None
            }
        };

        self.state.lock().disallow_updates = false;
        next
    }

    /// Commits the no-op of a new term, then applies everything it settles.
    fn open_term(&self, noop: &LogEntry, apply_from: LogIndex) -> Result<()> {
        let mut txn = self.store.begin_write()?;
        txn.append_log(noop)?;
        let ctx = self.prepare_commit(Some(noop))?;
        let committed = txn.commit();
        Self::complete(ctx, committed)?;
        self.apply_logs_range(apply_from, noop.index)
    }

    fn election_backoff(&self) -> Duration {
        let max = (self.config.ping_interval_ms / 2).max(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}
