use anyhow::{bail, Context, Result};
use quorum_common::config::load_config;
use quorum_common::metrics::MetricsCollector;
use quorum_common::types::ClusterConfig;
use quorum_replication::{
    Collaborators, DirectoryStateMachine, LocalNetwork, LogOperation, MemoryStore, RaftNode, Role,
};
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reports consensus metrics through the log.
struct TracingMetrics {
    node: String,
}

impl MetricsCollector for TracingMetrics {
    fn inc_counter(&self, name: &str) {
        debug!(node = %self.node, metric = name, "counter incremented");
    }

    fn observe_gauge(&self, name: &str, value: f64) {
        debug!(node = %self.node, metric = name, value, "gauge observed");
    }
}

/// Runs every member of the configured cluster in this process over the
/// in-memory network, replicates a few directory changes and prints the
/// resulting status of each node.
fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let path = env::args().nth(1).unwrap_or_else(|| "cluster.json".to_string());
    let config = load_config(&path).with_context(|| format!("loading {}", path))?;
    info!(config = %path, members = config.nodes.len(), "starting simulated cluster");

    let network = LocalNetwork::new();
    let mut nodes = Vec::with_capacity(config.nodes.len());
    for member in &config.nodes {
        let member_config = ClusterConfig {
            node_id: member.node_id.clone(),
            ..config.clone()
        };
        let collab = Collaborators::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DirectoryStateMachine),
            network.transport(&member.node_id),
        )
        .with_metrics(Arc::new(TracingMetrics {
            node: member.node_id.clone(),
        }));
        let node = RaftNode::start(member_config, collab)
            .with_context(|| format!("starting {}", member.node_id))?;
        network.register(&member.node_id, node.service());
        nodes.push(node);
    }

    let patience = config.raft.initial_election_wait() + 4 * config.raft.election_timeout();
    let leader = wait_for_leader(&nodes, patience)?;
    info!(leader = %nodes[leader].id(), term = nodes[leader].current_term(), "cluster has a leader");

    let batches = vec![
        vec![LogOperation::add(1, "dn=cn=admin,o=example")],
        vec![
            LogOperation::add(2, "dn=ou=people,o=example"),
            LogOperation::add(3, "dn=uid=jdoe,ou=people,o=example"),
        ],
        vec![LogOperation::modify(3, "dn=uid=jdoe,ou=people,o=example;mail=jdoe@example.org")],
    ];
    let mut last = 0;
    for ops in batches {
        match nodes[leader].submit(ops) {
            Ok(index) => {
                info!(index, "change replicated");
                last = index;
            }
            Err(e) => warn!(error = %e, "change rejected"),
        }
    }

    // The last change goes through the two-phase API step by step.
    let write = nodes[leader].begin_replicated_write(vec![LogOperation::delete(1)])?;
    info!(index = write.entry().index, "delete staged");
    match write.wait_for_quorum() {
        Ok(quorum) => {
            info!(index = quorum.index(), "delete reached quorum");
            last = quorum.commit()?;
        }
        Err(e) => warn!(error = %e, "delete rejected"),
    }

    // Followers learn the final commit index from the next ping.
    let settle = Instant::now() + 2 * config.raft.ping_interval() + config.raft.apply_poll();
    while Instant::now() < settle && nodes.iter().any(|n| n.status().last_applied < last) {
        thread::sleep(Duration::from_millis(20));
    }

    for node in &nodes {
        println!("{}", serde_json::to_string_pretty(&node.status())?);
    }

    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}

fn wait_for_leader(nodes: &[RaftNode], patience: Duration) -> Result<usize> {
    let deadline = Instant::now() + patience;
    loop {
        if let Some(leader) = nodes
            .iter()
            .position(|n| n.role() == Role::Leader && n.write_allowed())
        {
            return Ok(leader);
        }
        if Instant::now() >= deadline {
            bail!("no leader elected within {:?}", patience);
        }
        thread::sleep(Duration::from_millis(50));
    }
}
