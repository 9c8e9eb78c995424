use super::commit::PendingWrite;
use super::log::LogOperation;
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use super::signal::{Signals, Wake};
use super::state::{ProxyState, RaftState, Role};
use super::state_machine::StateMachine;
use super::store::{LogStore, PersistedVar};
use super::transport::{RaftService, RaftTransport};
use parking_lot::Mutex;
use quorum_common::config::RaftConfig;
use quorum_common::metrics::{MetricsCollector, NoopMetrics};
use quorum_common::types::{ClusterConfig, LogIndex, NodeId, Term};
use quorum_common::{QuorumError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// The pluggable pieces a node runs against.
pub struct Collaborators {
    pub store: Arc<dyn LogStore>,
    pub state_machine: Arc<dyn StateMachine>,
    pub transport: Arc<dyn RaftTransport>,
    pub metrics: Arc<dyn MetricsCollector>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn LogStore>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Self {
        Self {
            store,
            state_machine,
            transport,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Shared by the public handle, the background threads and the inbound
/// RPC handlers.
pub(crate) struct RaftCore {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) state: Mutex<RaftState>,
    /// Serializes inbound RPC handlers, term persistence and vote evaluation.
    pub(crate) rpc_reply: Mutex<()>,
    pub(crate) signals: Signals,
    pub(crate) store: Arc<dyn LogStore>,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) metrics: Arc<dyn MetricsCollector>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftCore {
    /// Loads persisted state and reconciles it with the stored log. Starts no
    /// threads.
    pub(crate) fn open(config: &ClusterConfig, collab: Collaborators) -> Result<Arc<Self>> {
        config.raft.validate()?;
        if !config.is_member(&config.node_id) {
            return Err(QuorumError::Config(format!(
                "node_id {} is not listed in nodes",
                config.node_id
            )));
        }

        let store = collab.store;
        let persisted = store.load_state()?;
        let mut st = RaftState::new(config.node_id.clone(), &persisted);
        st.quorum_override = config.raft.quorum_override;

        if let Some(last) = store.last_log()? {
            if last.index >= st.last_log_index {
                st.last_log_index = last.index;
                st.last_log_term = last.term;
            }
        }
        if let Some(first) = store.first_log()? {
            st.first_log_index = st.first_log_index.max(first.index);
        }
        if st.commit_index > 0 {
            if let Some(entry) = store.read_log(st.commit_index)? {
                st.commit_index_term = entry.term;
                if st.last_log_index == st.commit_index {
                    st.last_log_term = entry.term;
                }
            }
        }

        for peer in config.peers() {
            st.insert_peer(peer.node_id.clone(), ProxyState::Disconnected);
        }

        info!(
            node = %st.id,
            term = st.current_term,
            first = st.first_log_index,
            last_applied = st.last_applied,
            last_log = st.last_log_index,
            peers = st.peers.len(),
            "raft state loaded"
        );

        Ok(Arc::new(Self {
            id: config.node_id.clone(),
            config: config.raft.clone(),
            state: Mutex::new(st),
            rpc_reply: Mutex::new(()),
            signals: Signals::new(),
            store,
            state_machine: collab.state_machine,
            transport: collab.transport,
            metrics: collab.metrics,
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Standalone and quorum-override nodes have nobody to learn the commit
    /// index from, so everything in the local log is applied at startup.
    pub(crate) fn recover(&self) -> Result<()> {
        let target = {
            let st = self.state.lock();
            if st.cluster_size() >= 2 && !st.quorum_override {
                return Ok(());
            }
            st.last_log_index
        };
        self.apply_logs_upto(target)
    }

    pub(crate) fn spawn_worker<F>(self: &Arc<Self>, name: String, f: F) -> Result<()>
    where
        F: FnOnce(Arc<RaftCore>) + Send + 'static,
    {
        let core = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", name, self.id))
            .spawn(move || f(core))?;
        let mut workers = self.workers.lock();
        self.reap_finished(&mut workers);
        workers.push(handle);
        Ok(())
    }

    /// Joins drivers that already exited, such as those of removed peers.
    pub(crate) fn reap_workers(&self) {
        self.reap_finished(&mut self.workers.lock());
    }

    fn reap_finished(&self, workers: &mut Vec<JoinHandle<()>>) {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(workers)
            .into_iter()
            .partition(|handle| handle.is_finished());
        *workers = running;
        for handle in done {
            self.join_worker(handle);
        }
    }

    fn join_worker(&self, handle: JoinHandle<()>) {
        let name = handle.thread().name().unwrap_or("raft").to_string();
        if handle.join().is_err() {
            warn!(node = %self.id, thread = %name, "worker panicked");
        }
    }

    fn start_workers(self: &Arc<Self>) -> Result<()> {
        self.spawn_worker("election".into(), |core| core.run_election_loop())?;
        self.spawn_worker("applier".into(), |core| core.run_apply_loop())?;
        self.spawn_worker("compactor".into(), |core| core.run_compact_loop())?;

        let peers: Vec<(NodeId, u64)> = self
            .state
            .lock()
            .peers
            .values()
            .map(|p| (p.id.clone(), p.epoch))
            .collect();
        for (peer, epoch) in peers {
            self.spawn_peer(peer, epoch)?;
        }
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            self.signals.shutdown(&mut st);
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            self.join_worker(handle);
        }
        info!(node = %self.id, "raft stopped");
    }

    /// Drops to Follower and wakes everything waiting on leadership.
    pub(crate) fn step_down_locked(&self, st: &mut RaftState) {
        if st.role != Role::Follower {
            info!(node = %self.id, term = st.current_term, from = ?st.role, "stepping down");
        }
        st.role = Role::Follower;
        if st.leader.as_deref() == Some(self.id.as_str()) {
            st.leader = None;
        }
        self.signals.notify(st, Wake::VoteResult);
        self.signals.notify(st, Wake::AppendConsensus);
    }

    /// Persists `vars`; a failure forces Follower. Must be called without the
    /// state lock.
    pub(crate) fn persist_vars(&self, vars: &[PersistedVar]) -> Result<()> {
        if let Err(e) = self.store.persist(vars) {
            warn!(node = %self.id, error = %e, "failed to persist raft state");
            let mut st = self.state.lock();
            self.step_down_locked(&mut st);
            st.reset_ping();
            return Err(e);
        }
        Ok(())
    }

    /// Persists the in-memory term after it moved on an RPC reply.
    pub(crate) fn persist_current_term(&self) -> Result<()> {
        let _reply = self.rpc_reply.lock();
        let term = self.state.lock().current_term;
        self.persist_vars(&[PersistedVar::Term(term)])
    }

    pub(crate) fn add_peer_with_state(self: &Arc<Self>, peer: &str, state: ProxyState) -> Result<()> {
        if peer == self.id {
            return Err(QuorumError::InvalidRequest("cannot add self as a peer".into()));
        }
        let epoch = {
            let mut st = self.state.lock();
            if st.shutdown {
                return Err(QuorumError::Shutdown);
            }
            if st.peers.contains_key(peer) {
                return Err(QuorumError::InvalidRequest(format!("peer {} already exists", peer)));
            }
            st.insert_peer(peer.to_string(), state)
        };
        info!(node = %self.id, peer, ?state, "peer added");
        self.spawn_peer(peer.to_string(), epoch)
    }
}

impl RaftService for RaftCore {
    fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.handle_request_vote(req)
    }

    fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.handle_append_entries(req)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub id: NodeId,
    pub state: ProxyState,
    pub match_index: LogIndex,
}

/// Point-in-time view of a node for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub first_log_index: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub cluster_size: usize,
    pub quorum_override: bool,
    pub peers: Vec<PeerStatus>,
}

/// A running replica. Dropping it stops the background threads.
pub struct RaftNode {
    core: Arc<RaftCore>,
}

impl RaftNode {
    /// Opens the node, runs startup recovery and spawns the election,
    /// applier, compactor and per-peer threads.
    pub fn start(config: ClusterConfig, collab: Collaborators) -> Result<Self> {
        let core = RaftCore::open(&config, collab)?;
        core.recover()?;
        let node = Self { core };
        node.core.start_workers()?;
        info!(node = %node.core.id, "raft started");
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Inbound dispatch to register with a transport server.
    pub fn service(&self) -> Arc<dyn RaftService> {
        self.core.clone()
    }

    pub fn current_term(&self) -> Term {
        self.core.state.lock().current_term
    }

    /// A standalone node always reports itself as Leader.
    pub fn role(&self) -> Role {
        let st = self.core.state.lock();
        if st.cluster_size() < 2 {
            Role::Leader
        } else {
            st.role
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        let st = self.core.state.lock();
        if st.cluster_size() < 2 || st.role == Role::Leader {
            return Some(self.core.id.clone());
        }
        match st.role {
            Role::Follower => st.leader.clone(),
            _ => None,
        }
    }

    pub fn write_allowed(&self) -> bool {
        self.core.check_write_allowed(&self.core.state.lock()).is_ok()
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.core.state.lock();
        RaftStatus {
            id: st.id.clone(),
            role: st.role,
            term: st.current_term,
            leader: st.leader.clone(),
            first_log_index: st.first_log_index,
            last_log_index: st.last_log_index,
            last_log_term: st.last_log_term,
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            cluster_size: st.cluster_size(),
            quorum_override: st.quorum_override,
            peers: st
                .peers
                .values()
                .map(|p| PeerStatus {
                    id: p.id.clone(),
                    state: p.state,
                    match_index: p.match_index,
                })
                .collect(),
        }
    }

    /// Replicates `ops` as one log entry and applies it locally once a
    /// quorum holds it. Returns the entry's index.
    pub fn submit(&self, ops: Vec<LogOperation>) -> Result<LogIndex> {
        self.begin_replicated_write(ops)?.wait_for_quorum()?.commit()
    }

    /// First step of the two-phase write: stage the entry and its effects in
    /// a store transaction. See [`PendingWrite`].
    pub fn begin_replicated_write(&self, ops: Vec<LogOperation>) -> Result<PendingWrite<'_>> {
        self.core.begin_replicated_write(ops)
    }

    /// Adds a member that counts toward the quorum immediately.
    pub fn add_peer(&self, peer: &str) -> Result<()> {
        self.core.add_peer_with_state(peer, ProxyState::Disconnected)
    }

    /// Adds a member that only joins the quorum once it is seen campaigning.
    pub fn add_pending_peer(&self, peer: &str) -> Result<()> {
        self.core.add_peer_with_state(peer, ProxyState::PendingAdd)
    }

    /// Removes a peer. Its driver thread exits on its next wake-up.
    pub fn remove_peer(&self, peer: &str) -> Result<()> {
        let mut st = self.core.state.lock();
        if st.peers.remove(peer).is_none() {
            return Err(QuorumError::InvalidRequest(format!("no such peer {}", peer)));
        }
        info!(node = %self.core.id, peer, cluster_size = st.cluster_size(), "peer removed");
        self.core.signals.broadcast_request(&mut st);
        // The quorum just shrank; a pending commit may already have enough acks.
        self.core.signals.notify(&mut st, Wake::AppendConsensus);
        self.core.signals.notify(&mut st, Wake::PeersReady);
        drop(st);
        self.core.reap_workers();
        Ok(())
    }

    pub fn set_quorum_override(&self, enabled: bool) {
        let mut st = self.core.state.lock();
        if st.quorum_override != enabled {
            warn!(node = %self.core.id, enabled, "quorum override changed");
        }
        st.quorum_override = enabled;
    }

    /// Makes a follower campaign now instead of waiting for the election
    /// timeout.
    pub fn force_election(&self) -> Result<()> {
        let mut st = self.core.state.lock();
        if st.role != Role::Follower {
            return Err(QuorumError::UnwillingToPerform(format!(
                "force election requires Follower, role is {:?}",
                st.role
            )));
        }
        debug!(node = %self.core.id, "election forced");
        st.last_ping_recv = None;
        self.core.signals.notify(&mut st, Wake::VoteRequest);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}
