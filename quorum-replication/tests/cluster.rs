use quorum_common::config::RaftConfig;
use quorum_common::types::{ClusterConfig, NodeAddress};
use quorum_common::QuorumError;
use quorum_replication::{
    Collaborators, DirectoryStateMachine, LocalNetwork, LogOperation, MemoryStore, RaftNode, Role,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn timing() -> RaftConfig {
    RaftConfig {
        election_timeout_ms: 300,
        ping_interval_ms: 60,
        startup_grace_ms: 0,
        reconnect_interval_ms: 50,
        busy_peer_backoff_ms: 50,
        noop_commit_timeout_ms: 2_000,
        compact_interval_ms: 200,
        apply_poll_ms: 100,
        ..RaftConfig::default()
    }
}

struct Cluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<RaftNode>,
    stores: Vec<Arc<MemoryStore>>,
}

impl Cluster {
    fn start(ids: &[&str]) -> Self {
        let network = LocalNetwork::new();
        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        for id in ids {
            let config = ClusterConfig {
                node_id: id.to_string(),
                nodes: ids
                    .iter()
                    .enumerate()
                    .map(|(i, member)| NodeAddress {
                        host: "127.0.0.1".into(),
                        port: 7600 + i as u16,
                        node_id: member.to_string(),
                    })
                    .collect(),
                raft: timing(),
            };
            let store = Arc::new(MemoryStore::new());
            let collab = Collaborators::new(
                store.clone(),
                Arc::new(DirectoryStateMachine),
                network.transport(id),
            );
            let node = RaftNode::start(config, collab).unwrap();
            network.register(id, node.service());
            nodes.push(node);
            stores.push(store);
        }
        Self {
            network,
            nodes,
            stores,
        }
    }

    /// Waits for a leader that accepts writes.
    fn wait_for_leader(&self) -> usize {
        wait_until(Duration::from_secs(15), || {
            self.nodes
                .iter()
                .position(|n| n.role() == Role::Leader && n.write_allowed())
        })
        .expect("no leader elected")
    }

    /// Submits through whichever node currently leads, retrying across
    /// leadership changes. Returns the leader used and the entry index.
    fn submit(&self, ops: Vec<LogOperation>) -> (usize, u64) {
        wait_until(Duration::from_secs(15), || {
            let leader = self
                .nodes
                .iter()
                .position(|n| n.role() == Role::Leader && n.write_allowed())?;
            self.nodes[leader].submit(ops.clone()).ok().map(|index| (leader, index))
        })
        .expect("write never committed")
    }

    fn entry(&self, node: usize, id: u64) -> Option<Vec<u8>> {
        DirectoryStateMachine::read(&*self.stores[node], id)
            .unwrap()
            .map(|b| b.to_vec())
    }
}

fn wait_until<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_three_nodes_elect_and_replicate() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    cluster.wait_for_leader();

    let (_, index) =
        cluster.submit(vec![LogOperation::add(1, "cn=alice"), LogOperation::add(2, "cn=bob")]);
    assert!(index >= 2, "the no-op opens the term");

    for node in 0..3 {
        let applied = wait_until(Duration::from_secs(5), || {
            (cluster.nodes[node].status().last_applied >= index).then_some(())
        });
        assert!(applied.is_some(), "{} did not apply {}", cluster.nodes[node].id(), index);
        assert_eq!(cluster.entry(node, 1).as_deref(), Some(&b"cn=alice"[..]));
        assert_eq!(cluster.entry(node, 2).as_deref(), Some(&b"cn=bob"[..]));
        assert_eq!(cluster.stores[node].entries().last().unwrap().index, index);
    }

    let terms: Vec<_> = cluster.nodes.iter().map(|n| n.current_term()).collect();
    assert!(terms.iter().all(|t| *t == terms[0]));
}

#[test]
fn test_follower_write_refers_to_leader() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    let leader = cluster.wait_for_leader();
    let follower = (leader + 1) % 3;
    let follower_id = cluster.nodes[follower].id().to_string();

    wait_until(Duration::from_secs(5), || cluster.nodes[follower].leader());
    match cluster.nodes[follower].submit(vec![LogOperation::add(1, "cn=x")]) {
        Err(QuorumError::NotLeader { leader }) => {
            assert!(leader.is_some());
            assert_ne!(leader, Some(follower_id));
        }
        other => panic!("expected a referral, got {:?}", other.map(|_| ())),
    }
    assert!(!cluster.nodes[follower].write_allowed());
}

#[test]
fn test_isolated_follower_catches_up_after_heal() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    let leader = cluster.wait_for_leader();
    let lagging = (leader + 1) % 3;
    let lagging_id = cluster.nodes[lagging].id().to_string();

    cluster.network.isolate(&lagging_id);
    let mut last = 0;
    for id in 1..=3 {
        last = cluster.submit(vec![LogOperation::add(id, format!("cn=user{}", id))]).1;
    }
    assert!(cluster.nodes[lagging].status().last_applied < last);

    cluster.network.heal();
    let caught_up = wait_until(Duration::from_secs(15), || {
        (cluster.nodes[lagging].status().last_applied >= last).then_some(())
    });
    assert!(caught_up.is_some(), "{} never caught up", lagging_id);
    for id in 1..=3 {
        assert_eq!(
            cluster.entry(lagging, id),
            Some(format!("cn=user{}", id).into_bytes())
        );
    }
}

#[test]
fn test_leader_without_quorum_steps_down() {
    let ids = ["n1", "n2", "n3", "n4", "n5"];
    let cluster = Cluster::start(&ids);
    let leader = cluster.wait_for_leader();

    let leader_id = cluster.nodes[leader].id();
    let silent: Vec<_> = ids.iter().filter(|id| **id != leader_id).take(3).collect();
    for id in &silent {
        cluster.network.set_unresponsive(id, true);
    }

    let err = cluster.nodes[leader]
        .submit(vec![LogOperation::add(42, "cn=lost")])
        .unwrap_err();
    assert!(err.is_unwilling(), "unexpected error {}", err);
    assert_ne!(cluster.nodes[leader].status().role, Role::Leader);
    assert!(cluster.entry(leader, 42).is_none());

    // Once the network recovers some node leads again and writes go through.
    cluster.network.heal();
    let (leader, _) = cluster.submit(vec![LogOperation::add(43, "cn=back")]);
    assert!(cluster.entry(leader, 43).is_some());
}

#[test]
fn test_at_most_one_leader_per_term() {
    let cluster = Cluster::start(&["n1", "n2", "n3"]);
    let first = cluster.wait_for_leader();
    let first_id = cluster.nodes[first].id().to_string();

    let mut leaders: HashMap<u64, String> = HashMap::new();
    let mut observe = |cluster: &Cluster| {
        for node in &cluster.nodes {
            let status = node.status();
            if status.role == Role::Leader {
                let holder = leaders.entry(status.term).or_insert_with(|| status.id.clone());
                assert_eq!(*holder, status.id, "two leaders in term {}", status.term);
            }
        }
    };

    cluster.network.isolate(&first_id);
    let deadline = Instant::now() + Duration::from_secs(15);
    let second = loop {
        observe(&cluster);
        let found = cluster.nodes.iter().position(|n| {
            n.id() != first_id && n.role() == Role::Leader && n.write_allowed()
        });
        if let Some(found) = found {
            break found;
        }
        assert!(Instant::now() < deadline, "no leader after isolating {}", first_id);
        thread::sleep(Duration::from_millis(10));
    };
    assert_ne!(cluster.nodes[second].id(), first_id);

    cluster.network.heal();
    let settle = Instant::now() + Duration::from_secs(2);
    while Instant::now() < settle {
        observe(&cluster);
        thread::sleep(Duration::from_millis(10));
    }
    cluster.submit(vec![LogOperation::add(7, "cn=after-heal")]);
}

#[test]
fn test_standalone_node_accepts_writes() {
    let cluster = Cluster::start(&["solo"]);
    let node = &cluster.nodes[0];
    assert_eq!(node.role(), Role::Leader);
    assert_eq!(node.leader().as_deref(), Some("solo"));

    assert_eq!(node.submit(vec![LogOperation::add(1, "cn=only")]).unwrap(), 1);
    assert_eq!(node.submit(vec![LogOperation::modify(1, "cn=changed")]).unwrap(), 2);
    assert_eq!(cluster.entry(0, 1).as_deref(), Some(&b"cn=changed"[..]));
    assert_eq!(node.status().last_applied, 2);
}
