use super::log::LogEntry;
use super::node::RaftCore;
use super::rpc::{AppendEntriesRequest, AppendStatus, RequestVoteRequest, VoteStatus};
use super::signal::{WaitOutcome, Wake};
use super::state::{ProxyState, RaftState, ReplCmd, Role};
use quorum_common::types::{LogIndex, NodeId, Term};
use quorum_common::{QuorumError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What a driver does after one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Continuation {
    /// Go back to waiting for the next request or ping deadline.
    Wait,
    /// New work arrived while the RPC was in flight; dispatch again now.
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendKind {
    /// Replicate the in-flight entry.
    Append,
    /// Heartbeat carrying the leader's last index, closing any gap found.
    Ping,
}

/// Replication state owned by one peer thread.
pub(crate) struct PeerDriver {
    pub(crate) peer: NodeId,
    pub(crate) epoch: u64,
    seen: u64,
    last_sent: Option<Instant>,
}

impl PeerDriver {
    pub(crate) fn new(peer: NodeId, epoch: u64) -> Self {
        Self {
            peer,
            epoch,
            seen: 0,
            last_sent: None,
        }
    }

    fn ping_due_in(&self, interval: Duration) -> Duration {
        self.last_sent
            .map_or(Duration::ZERO, |t| interval.saturating_sub(t.elapsed()))
    }
}

impl RaftCore {
    pub(crate) fn spawn_peer(self: &Arc<Self>, peer: NodeId, epoch: u64) -> Result<()> {
        self.spawn_worker(format!("peer-{}", peer), move |core| {
            core.run_peer_loop(PeerDriver::new(peer, epoch))
        })
    }

    fn run_peer_loop(&self, mut driver: PeerDriver) {
        driver.seen = self.state.lock().request_gen;
        debug!(node = %self.id, peer = %driver.peer, "replication driver started");

        while self.ensure_connected(&mut driver) {
            let mut st = self.state.lock();
            let Some(proxy) = st.peer_mut(&driver.peer, driver.epoch) else {
                break;
            };
            proxy.state = ProxyState::Idle;
            if st.peers_idle() >= st.cluster_size() / 2 {
                self.signals.notify(&mut st, Wake::PeersReady);
            }

            let timeout = if st.role == Role::Leader {
                driver.ping_due_in(self.config.ping_interval())
            } else {
                self.config.ping_interval()
            };
            if self.signals.wait_request(&mut st, &mut driver.seen, timeout) == WaitOutcome::Shutdown {
                break;
            }

            match st.peer_mut(&driver.peer, driver.epoch) {
                Some(proxy) if proxy.state == ProxyState::Idle => proxy.state = ProxyState::Busy,
                Some(_) => continue,
                None => break,
            }
            drop(st);

            while self.dispatch(&mut driver) == Continuation::Repeat {}
        }

        debug!(node = %self.id, peer = %driver.peer, "replication driver stopped");
    }

    /// Returns false once the driver should exit.
    fn ensure_connected(&self, driver: &mut PeerDriver) -> bool {
        loop {
            let mut st = self.state.lock();
            if st.shutdown {
                return false;
            }
            let state = match st.peer(&driver.peer, driver.epoch) {
                Some(proxy) => proxy.state,
                None => return false,
            };
            match state {
                ProxyState::Idle | ProxyState::Busy => return true,
                ProxyState::PendingAdd => {
                    let _ = self.signals.wait_request(
                        &mut st,
                        &mut driver.seen,
                        self.config.reconnect_interval(),
                    );
                }
                ProxyState::Disconnected => {
                    drop(st);
                    let result = self.transport.connect(&driver.peer);
                    let mut st = self.state.lock();
                    match result {
                        Ok(()) => {
                            if let Some(proxy) = st.peer_mut(&driver.peer, driver.epoch) {
                                if proxy.state == ProxyState::Disconnected {
                                    proxy.state = ProxyState::Idle;
                                    info!(node = %self.id, peer = %driver.peer, "peer connected");
                                }
                            }
                        }
                        Err(e) => {
                            debug!(node = %self.id, peer = %driver.peer, error = %e, "connect failed");
                            let _ = self.signals.wait_request(
                                &mut st,
                                &mut driver.seen,
                                self.config.reconnect_interval(),
                            );
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, driver: &mut PeerDriver) -> Continuation {
        let mut st = self.state.lock();
        if st.shutdown {
            return Continuation::Wait;
        }
        let Some(proxy) = st.peer(&driver.peer, driver.epoch) else {
            return Continuation::Wait;
        };
        let replicated = proxy.log_replicated;
        let vote_requested_term = proxy.vote_requested_term;
        let role = st.role;

        match role {
            Role::Leader => {
                let kind = if st.cmd == ReplCmd::AppendEntries
                    && st.pending_entry.is_some()
                    && !replicated
                {
                    AppendKind::Append
                } else if driver.ping_due_in(self.config.ping_interval()) == Duration::ZERO {
                    AppendKind::Ping
                } else {
                    return Continuation::Wait;
                };
                drop(st);

                driver.last_sent = Some(Instant::now());
                let result = self.append_entries_rpc(driver, kind);
                if let Err(e) = &result {
                    debug!(node = %self.id, peer = %driver.peer, ?kind, error = %e, "append entries failed");
                }

                let st = self.state.lock();
                let again = result.is_ok()
                    && st.role == Role::Leader
                    && st.cmd == ReplCmd::AppendEntries
                    && match (st.pending_entry.as_ref(), st.peer(&driver.peer, driver.epoch)) {
                        (Some(entry), Some(proxy)) => {
                            entry.index > proxy.match_index
                                && !proxy.log_replicated
                                && proxy.state != ProxyState::Disconnected
                        }
                        _ => false,
                    };
                if again {
                    Continuation::Repeat
                } else {
                    Continuation::Wait
                }
            }
            Role::Candidate
                if st.cmd == ReplCmd::RequestVote && vote_requested_term != st.current_term =>
            {
                let term = st.current_term;
                if let Some(proxy) = st.peer_mut(&driver.peer, driver.epoch) {
                    proxy.vote_requested_term = term;
                }
                drop(st);
                self.request_vote_rpc(driver, term);
                Continuation::Wait
            }
            _ => Continuation::Wait,
        }
    }

    /// Asks one peer for its vote in `term` and folds the answer into the tally.
    pub(crate) fn request_vote_rpc(&self, driver: &PeerDriver, term: Term) {
        let req = {
            let st = self.state.lock();
            RequestVoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index: st.last_log_index,
                last_log_term: st.last_log_term,
            }
        };

        let result = self.transport.request_vote(&driver.peer, req);

        let mut st = self.state.lock();
        let mut persist_term = false;
        match result {
            Ok(resp) if resp.term > st.current_term => {
                info!(node = %self.id, peer = %driver.peer, term = resp.term, "peer has newer term, abandoning election");
                st.observe_term(resp.term);
                st.vote_denied_cnt += 1;
                self.step_down_locked(&mut st);
                st.reset_ping();
                persist_term = true;
            }
            Ok(_) if st.role != Role::Candidate || st.current_term != term => {
                debug!(node = %self.id, peer = %driver.peer, term, "vote reply for a finished election");
            }
            Ok(resp) => match resp.vote {
                VoteStatus::Granted => {
                    st.vote_consensus_cnt += 1;
                    debug!(node = %self.id, peer = %driver.peer, term, votes = st.vote_consensus_cnt, "vote granted");
                    if st.has_vote_majority() {
                        self.signals.notify(&mut st, Wake::VoteResult);
                    }
                }
                VoteStatus::Denied => st.vote_denied_cnt += 1,
                VoteStatus::DeniedLogLonger => {
                    info!(node = %self.id, peer = %driver.peer, term, "peer log is ahead of ours, withdrawing");
                    st.vote_denied_cnt += 1;
                    self.step_down_locked(&mut st);
                    st.reset_ping();
                }
            },
            Err(e) => {
                if e.is_connectivity() {
                    if let Some(proxy) = st.peer_mut(&driver.peer, driver.epoch) {
                        proxy.state = ProxyState::Disconnected;
                    }
                }
                debug!(node = %self.id, peer = %driver.peer, term, error = %e, "request vote failed");
            }
        }

        // Every reachable peer has answered.
        if st.role == Role::Candidate
            && st.current_term == term
            && st.vote_consensus_cnt.saturating_sub(1) + st.vote_denied_cnt >= st.peers_connected()
        {
            self.signals.notify(&mut st, Wake::VoteResult);
        }
        drop(st);

        if persist_term {
            let _ = self.persist_current_term();
        }
    }

    /// Sends the in-flight entry or a ping, walking back on mismatch and
    /// forward until the peer has caught up with what was targeted.
    pub(crate) fn append_entries_rpc(&self, driver: &PeerDriver, kind: AppendKind) -> Result<()> {
        let (mut req, target) = {
            let st = self.state.lock();
            if st.role != Role::Leader {
                return Ok(());
            }
            let (target, prev, entries) = match kind {
                AppendKind::Append => match st.pending_entry.as_ref() {
                    Some(entry) => (entry.index, entry.index - 1, vec![entry.clone()]),
                    None => return Ok(()),
                },
                AppendKind::Ping => (st.last_log_index, st.last_log_index, Vec::new()),
            };
            let prev_log_term = self.prev_log_term(&st, prev)?;
            let req = AppendEntriesRequest {
                term: st.current_term,
                leader_id: self.id.clone(),
                prev_log_index: prev,
                prev_log_term,
                entries,
                leader_commit: st.commit_index,
            };
            (req, target)
        };

        loop {
            let resp = match self.transport.append_entries(&driver.peer, req.clone()) {
                Ok(resp) => resp,
                Err(e) => return Err(self.append_failed(driver, e)),
            };

            let mut st = self.state.lock();
            if resp.term > st.current_term {
                info!(node = %self.id, peer = %driver.peer, term = resp.term, "peer has newer term, stepping down");
                st.observe_term(resp.term);
                self.step_down_locked(&mut st);
                st.reset_ping();
                drop(st);
                let _ = self.persist_current_term();
                return Ok(());
            }
            if st.role != Role::Leader || st.current_term != req.term {
                debug!(node = %self.id, peer = %driver.peer, "role changed during append entries");
                return Ok(());
            }

            let (prev, prev_term, entry) = match resp.status {
                AppendStatus::Mismatch { last_log_index } => {
                    let fetch = self.backfill_index(req.prev_log_index, last_log_index);
                    debug!(node = %self.id, peer = %driver.peer, prev = req.prev_log_index, hint = last_log_index, fetch, "peer log mismatch");
                    let entry = self.entry_at(&st, fetch)?;
                    (fetch - 1, self.prev_log_term(&st, fetch - 1)?, entry)
                }
                AppendStatus::Success => {
                    let (acked, acked_term) = req
                        .entries
                        .last()
                        .map_or((req.prev_log_index, req.prev_log_term), |e| (e.index, e.term));
                    self.record_ack(&mut st, driver, acked);
                    if acked >= target {
                        return Ok(());
                    }
                    let next = acked + 1;
                    if next > st.last_log_index
                        && st.pending_entry.as_ref().map(|e| e.index) != Some(next)
                    {
                        return Ok(());
                    }
                    (acked, acked_term, self.entry_at(&st, next)?)
                }
            };

            req.prev_log_index = prev;
            req.prev_log_term = prev_term;
            req.entries = vec![entry];
            req.leader_commit = st.commit_index;
        }
    }

    /// Where to resume after a mismatch. A follower far behind is probed from
    /// just above its last index instead of walking back one entry at a time.
    pub(crate) fn backfill_index(&self, prev: LogIndex, hint: LogIndex) -> LogIndex {
        let margin = self.config.prev_log_fetch_margin;
        let fetch = if prev > hint + margin { hint + margin } else { prev };
        fetch.max(1)
    }

    fn record_ack(&self, st: &mut RaftState, driver: &PeerDriver, acked: LogIndex) {
        let pending = st.pending_entry.as_ref().map(|e| e.index);
        let in_flight = st.cmd == ReplCmd::AppendEntries;
        let Some(proxy) = st.peer_mut(&driver.peer, driver.epoch) else {
            return;
        };
        proxy.match_index = proxy.match_index.max(acked);
        if let Some(pending) = pending {
            if in_flight && acked >= pending && !proxy.log_replicated {
                proxy.log_replicated = true;
                if st.has_append_consensus() {
                    self.signals.notify(st, Wake::AppendConsensus);
                }
            }
        }
    }

    fn append_failed(&self, driver: &PeerDriver, err: QuorumError) -> QuorumError {
        if err.is_connectivity() {
            let mut st = self.state.lock();
            if let Some(proxy) = st.peer_mut(&driver.peer, driver.epoch) {
                if proxy.state != ProxyState::Disconnected {
                    warn!(node = %self.id, peer = %driver.peer, error = %err, "peer disconnected");
                }
                proxy.state = ProxyState::Disconnected;
            }
        } else if err.is_unwilling() {
            let mut st = self.state.lock();
            let _ = self.signals.pause(&mut st, self.config.busy_peer_backoff());
        }
        err
    }

    /// The pending entry if it sits at `index`, otherwise the stored one.
    fn entry_at(&self, st: &RaftState, index: LogIndex) -> Result<LogEntry> {
        if let Some(entry) = st.pending_entry.as_ref().filter(|e| e.index == index) {
            return Ok(entry.clone());
        }
        self.store
            .read_log(index)?
            .ok_or(QuorumError::LogMissing(index))
    }

    fn prev_log_term(&self, st: &RaftState, index: LogIndex) -> Result<Term> {
        if index == 0 {
            return Ok(0);
        }
        if index == st.last_log_index && st.last_log_term > 0 {
            return Ok(st.last_log_term);
        }
        self.store
            .read_log(index)?
            .map(|e| e.term)
            .ok_or(QuorumError::LogMissing(index))
    }
}
