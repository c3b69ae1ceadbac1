//! Keep-alive handle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of the handle owned by a keep-alive supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    #[default]
    Absent,
    Starting,
    Ready,
    Closed,
}

/// Why a ready handle was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    IdleTimeout,
    Shutdown,
    StreamClosed,
    CallTimeout,
    CallFailed,
}

/// State machine for tracking handle progress.
#[derive(Debug, Clone)]
pub struct HandleStateMachine {
    state: HandleState,
    spawns: usize,
    calls: usize,
    restarts: usize,
    timeouts: usize,
    evictions: usize,
}

impl Default for HandleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: HandleState::Absent,
            spawns: 0,
            calls: 0,
            restarts: 0,
            timeouts: 0,
            evictions: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn transition(&mut self, new_state: HandleState) {
        tracing::debug!(from = ?self.state, to = ?new_state, "Handle state transition");
        self.state = new_state;
    }

    pub fn record_spawn(&mut self) {
        self.spawns = self.spawns.saturating_add(1);
    }

    pub fn record_call(&mut self) {
        self.calls = self.calls.saturating_add(1);
    }

    /// Record a closed handle and move to `Closed`.
    pub fn record_close(&mut self, reason: CloseReason) {
        match reason {
            CloseReason::StreamClosed => self.restarts = self.restarts.saturating_add(1),
            CloseReason::CallTimeout => self.timeouts = self.timeouts.saturating_add(1),
            CloseReason::IdleTimeout => self.evictions = self.evictions.saturating_add(1),
            CloseReason::Shutdown | CloseReason::CallFailed => {}
        }
        tracing::debug!(reason = ?reason, "Handle closed");
        self.transition(HandleState::Closed);
    }

    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            spawns: self.spawns,
            calls: self.calls,
            restarts: self.restarts,
            timeouts: self.timeouts,
            evictions: self.evictions,
        }
    }
}

/// Supervisor statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    /// Tool processes started.
    pub spawns: usize,
    /// Calls that returned a response batch.
    pub calls: usize,
    /// Handles replaced after the stream closed under a call.
    pub restarts: usize,
    /// Calls cut short by the watchdog.
    pub timeouts: usize,
    /// Handles closed for inactivity.
    pub evictions: usize,
}
