use crate::error::{QuorumError, Result};
use crate::types::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Loads a cluster configuration from a JSON file and validates its timing.
pub fn load_config(path: &str) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    if !config.is_member(&config.node_id) {
        return Err(QuorumError::Config(format!(
            "node_id {} is not listed in nodes",
            config.node_id
        )));
    }
    config.raft.validate()?;
    Ok(config)
}

/// Timing and retention knobs for the consensus engine. Durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_ms: u64,
    pub ping_interval_ms: u64,
    /// Entries kept behind the commit index before compaction kicks in.
    pub keep_logs: u64,
    /// Commit without consensus. Single-node disaster recovery only.
    pub quorum_override: bool,
    /// Quorum-wait rounds allowed before a leader steps down.
    pub consensus_retry_limit: u32,
    pub noop_commit_timeout_ms: u64,
    pub prev_log_fetch_margin: u64,
    pub compact_interval_ms: u64,
    pub compact_batch: u64,
    pub first_log_persist_every: u64,
    pub apply_poll_ms: u64,
    pub reconnect_interval_ms: u64,
    pub busy_peer_backoff_ms: u64,
    pub startup_grace_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 20_000,
            ping_interval_ms: 7_000,
            keep_logs: 100,
            quorum_override: false,
            consensus_retry_limit: 2,
            noop_commit_timeout_ms: 300_000,
            prev_log_fetch_margin: 64,
            compact_interval_ms: 2_000,
            compact_batch: 50,
            first_log_persist_every: 200,
            apply_poll_ms: 10_000,
            reconnect_interval_ms: 3_000,
            busy_peer_backoff_ms: 1_000,
            startup_grace_ms: 5_000,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_ms < 10 {
            return Err(QuorumError::Config(
                "election_timeout_ms must be at least 10".into(),
            ));
        }
        if self.ping_interval_ms < 20 {
            return Err(QuorumError::Config(
                "ping_interval_ms must be at least 20".into(),
            ));
        }
        if self.election_timeout_ms <= 2 * self.ping_interval_ms {
            return Err(QuorumError::Config(format!(
                "election_timeout_ms ({}) must be greater than twice ping_interval_ms ({})",
                self.election_timeout_ms, self.ping_interval_ms
            )));
        }
        if self.keep_logs == 0 || self.compact_batch == 0 || self.first_log_persist_every == 0 {
            return Err(QuorumError::Config(
                "keep_logs, compact_batch and first_log_persist_every must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn noop_commit_timeout(&self) -> Duration {
        Duration::from_millis(self.noop_commit_timeout_ms)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_millis(self.compact_interval_ms)
    }

    pub fn apply_poll(&self) -> Duration {
        Duration::from_millis(self.apply_poll_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn busy_peer_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_peer_backoff_ms)
    }

    /// The first election is delayed so peers have time to come up.
    pub fn initial_election_wait(&self) -> Duration {
        Duration::from_millis(2 * self.election_timeout_ms + self.startup_grace_ms)
    }
}
