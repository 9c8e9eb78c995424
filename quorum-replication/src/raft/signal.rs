use super::state::RaftState;
use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// Typed wake-ups exchanged between the consensus threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Enough replication drivers are idle to start a round.
    PeersReady,
    /// Ask the election engine to re-evaluate its deadline.
    VoteRequest,
    /// Election outcome is known, or the candidate lost its footing.
    VoteResult,
    /// The in-flight entry reached quorum, or leadership changed underneath it.
    AppendConsensus,
    /// New committed entries are ready for the log applier.
    NewLog,
}

const WAKE_KINDS: usize = 5;

impl Wake {
    fn slot(self) -> usize {
        match self {
            Wake::PeersReady => 0,
            Wake::VoteRequest => 1,
            Wake::VoteResult => 2,
            Wake::AppendConsensus => 3,
            Wake::NewLog => 4,
        }
    }
}

/// Pending wake-ups, guarded by the state mutex so a notification raised
/// before the waiter arrives is still observed.
#[derive(Debug, Default)]
pub struct Latches {
    pending: [bool; WAKE_KINDS],
}

impl Latches {
    fn raise(&mut self, wake: Wake) {
        self.pending[wake.slot()] = true;
    }

    fn take(&mut self, wake: Wake) -> bool {
        std::mem::replace(&mut self.pending[wake.slot()], false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Shutdown,
}

/// Condition variables paired with the state mutex.
#[derive(Default)]
pub struct Signals {
    conds: [Condvar; WAKE_KINDS],
    request: Condvar,
    idle: Condvar,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, st: &mut RaftState, wake: Wake) {
        st.latches.raise(wake);
        self.conds[wake.slot()].notify_all();
    }

    /// Drops a stale notification before starting a fresh wait cycle.
    pub fn clear(&self, st: &mut RaftState, wake: Wake) {
        st.latches.take(wake);
    }

    /// Waits for `wake` or the timeout. A latched notification returns at once.
    pub fn wait(
        &self,
        guard: &mut MutexGuard<'_, RaftState>,
        wake: Wake,
        timeout: Duration,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let cond = &self.conds[wake.slot()];
        loop {
            if guard.shutdown {
                return WaitOutcome::Shutdown;
            }
            if guard.latches.take(wake) {
                return WaitOutcome::Woken;
            }
            if cond.wait_until(guard, deadline).timed_out() {
                if guard.shutdown {
                    return WaitOutcome::Shutdown;
                }
                return if guard.latches.take(wake) {
                    WaitOutcome::Woken
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }

    /// Wakes every replication driver. Each driver tracks the generation it
    /// has seen, so a broadcast is never lost.
    pub fn broadcast_request(&self, st: &mut RaftState) {
        st.request_gen = st.request_gen.wrapping_add(1);
        self.request.notify_all();
    }

    pub fn wait_request(
        &self,
        guard: &mut MutexGuard<'_, RaftState>,
        seen: &mut u64,
        timeout: Duration,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if guard.shutdown {
                return WaitOutcome::Shutdown;
            }
            if guard.request_gen != *seen {
                *seen = guard.request_gen;
                return WaitOutcome::Woken;
            }
            if self.request.wait_until(guard, deadline).timed_out() {
                if guard.shutdown {
                    return WaitOutcome::Shutdown;
                }
                if guard.request_gen != *seen {
                    *seen = guard.request_gen;
                    return WaitOutcome::Woken;
                }
                return WaitOutcome::TimedOut;
            }
        }
    }

    /// Sleeps for `timeout` unless shutdown is requested first.
    pub fn pause(&self, guard: &mut MutexGuard<'_, RaftState>, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        while !guard.shutdown {
            if self.idle.wait_until(guard, deadline).timed_out() {
                break;
            }
        }
        if guard.shutdown {
            WaitOutcome::Shutdown
        } else {
            WaitOutcome::TimedOut
        }
    }

    pub fn shutdown(&self, st: &mut RaftState) {
        st.shutdown = true;
        for cond in &self.conds {
            cond.notify_all();
        }
        self.request.notify_all();
        self.idle.notify_all();
    }
}
