//! Fixtures shared by the unit tests.

use super::node::{Collaborators, RaftCore};
use super::state::ProxyState;
use super::state_machine::DirectoryStateMachine;
use super::store::MemoryStore;
use super::transport::{LocalNetwork, RaftService};
use quorum_common::config::RaftConfig;
use quorum_common::types::{ClusterConfig, NodeAddress};
use std::sync::Arc;

/// Short timings so tests that do wait finish quickly.
pub(crate) fn test_raft_config() -> RaftConfig {
    RaftConfig {
        election_timeout_ms: 300,
        ping_interval_ms: 60,
        consensus_retry_limit: 2,
        noop_commit_timeout_ms: 2_000,
        compact_interval_ms: 200,
        apply_poll_ms: 100,
        reconnect_interval_ms: 50,
        busy_peer_backoff_ms: 50,
        startup_grace_ms: 0,
        ..RaftConfig::default()
    }
}

pub(crate) fn cluster_config(id: &str, members: &[&str], raft: RaftConfig) -> ClusterConfig {
    ClusterConfig {
        node_id: id.to_string(),
        nodes: members
            .iter()
            .enumerate()
            .map(|(i, member)| NodeAddress {
                host: "127.0.0.1".into(),
                port: 7400 + i as u16,
                node_id: member.to_string(),
            })
            .collect(),
        raft,
    }
}

/// Opens a core without starting its threads and plugs it into `network`.
pub(crate) fn open_core(
    id: &str,
    members: &[&str],
    store: Arc<MemoryStore>,
    network: &Arc<LocalNetwork>,
) -> Arc<RaftCore> {
    let config = cluster_config(id, members, test_raft_config());
    let collab = Collaborators::new(store, Arc::new(DirectoryStateMachine), network.transport(id));
    let core = RaftCore::open(&config, collab).unwrap();
    network.register(id, Arc::clone(&core) as Arc<dyn RaftService>);
    core
}

pub(crate) fn open_cluster(ids: &[&str]) -> (Vec<Arc<RaftCore>>, Vec<Arc<MemoryStore>>, Arc<LocalNetwork>) {
    let network = LocalNetwork::new();
    let stores: Vec<_> = ids.iter().map(|_| Arc::new(MemoryStore::new())).collect();
    let cores = ids
        .iter()
        .zip(&stores)
        .map(|(id, store)| open_core(id, ids, Arc::clone(store), &network))
        .collect();
    (cores, stores, network)
}

/// Marks every peer as reachable and idle, as if the drivers had connected.
pub(crate) fn connect_all(core: &RaftCore) {
    let mut st = core.state.lock();
    for peer in st.peers.values_mut() {
        peer.state = ProxyState::Idle;
    }
}
