//! Worker runtime: state machine, dispatch, sessions, heartbeat, HTTP.
//!
//! A worker process wires these together:
//!
//! ```text
//!            ┌────────────────────────────────┐
//!            │            Worker              │
//!            │  consume → dispatch → ack/DLQ  │
//!            └───┬──────────────┬─────────────┘
//!                │ watch        │ counters
//!        ┌───────▼─────┐  ┌─────▼─────────┐
//!        │  Heartbeat  │  │  HTTP surface │
//!        │ hash + TTL  │  │ /health       │
//!        │ status strm │  │ /metrics      │
//!        └─────────────┘  └───────────────┘
//! ```
//!
//! See [`runtime::Worker::run`] for the loop semantics.

pub mod handler;
pub mod heartbeat;
pub mod http;
pub mod runtime;
pub mod state;

pub use handler::{Handler, HandlerError, HandlerRegistry, Session, SessionBag};
pub use heartbeat::{fetch_heartbeats, Heartbeat, HeartbeatSnapshot};
pub use http::HttpState;
pub use runtime::{
    control_channel, ShutdownHandle, Worker, WorkerConfig, WorkerCounters, WorkerError,
    DRAIN_MESSAGE,
};
pub use state::{StateMachine, WorkerState};
