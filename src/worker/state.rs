//! Worker state machine.
//!
//! States and transitions:
//!
//! ```text
//!   idle ──> waiting ──> busy ──> idle
//!     ^         │          │
//!     └── error <──────────┘      any ──> shutdown
//! ```
//!
//! Observers (the HTTP surface, the heartbeat task) watch the state via
//! a [`tokio::sync::watch`] channel instead of polling shared fields.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Between jobs, not blocked on the queue.
    Idle,
    /// Blocked in a consume call.
    Waiting,
    /// Processing a job.
    Busy,
    /// Recovering from a loop-level failure with back-off.
    Error,
    /// Draining; no new jobs will be accepted.
    Shutdown,
}

impl WorkerState {
    /// Numeric encoding used by the `worker_state` metric gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Waiting => 1,
            WorkerState::Busy => 2,
            WorkerState::Error => 3,
            WorkerState::Shutdown => 4,
        }
    }

    /// Whether the transition to `next` is part of the designed
    /// lifecycle. Used to flag bugs, not to block transitions.
    fn allows(self, next: WorkerState) -> bool {
        use WorkerState::*;
        if matches!(next, Error | Shutdown) {
            return self != Shutdown;
        }
        matches!(
            (self, next),
            (Idle, Waiting) | (Waiting, Busy) | (Waiting, Idle) | (Busy, Idle) | (Error, Idle)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Waiting => write!(f, "waiting"),
            WorkerState::Busy => write!(f, "busy"),
            WorkerState::Error => write!(f, "error"),
            WorkerState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Observable state holder for a worker.
pub struct StateMachine {
    tx: watch::Sender<WorkerState>,
}

impl StateMachine {
    pub fn new(initial: WorkerState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> WorkerState {
        *self.tx.borrow()
    }

    /// Transitions to `next`, logging the change. Unexpected transitions
    /// are logged at warn level but still applied; the worker must never
    /// wedge because of a bookkeeping bug.
    pub fn set(&self, next: WorkerState) {
        let current = self.get();
        if current == next {
            return;
        }
        if current.allows(next) {
            info!(from = %current, to = %next, "worker state transition");
        } else {
            warn!(from = %current, to = %next, "unexpected worker state transition");
        }
        let _ = self.tx.send_replace(next);
    }

    /// Watch channel for observers (health endpoint, heartbeat).
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(WorkerState::Idle)
    }
}
