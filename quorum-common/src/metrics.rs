/// Simple trait for metrics instrumentation
pub trait MetricsCollector: Send + Sync {
    fn inc_counter(&self, name: &str);
    fn observe_gauge(&self, name: &str, value: f64);
}

pub const ELECTIONS_TRIGGERED: &str = "raft.elections_triggered";
pub const LEADER_ELECTED: &str = "raft.leader_elected";
pub const COMMIT_STEP_DOWN: &str = "raft.commit_step_down";
pub const LOGS_COMPACTED: &str = "raft.logs_compacted";
pub const COMMIT_INDEX: &str = "raft.commit_index";

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn inc_counter(&self, _name: &str) {}
    fn observe_gauge(&self, _name: &str, _value: f64) {}
}
