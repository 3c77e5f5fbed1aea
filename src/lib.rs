//! taskplane: distributed task-execution control plane.
//!
//! Jobs flow from front-ends through named queue streams to a fleet of
//! stateful workers; an autoscaler watches queue pressure and drives
//! an orchestration backend (container daemon, Kubernetes, Fly.io) to
//! keep the fleet sized to demand.
//!
//! The load-bearing pieces:
//!
//! - [`store`]: narrow client over a log-structured key/stream store,
//!   with a primary/secondary failover composite and an in-memory fake
//! - [`broker`]: publish/consume/ack/reclaim/dead-letter over streams
//!   and consumer groups, with at-least-once delivery
//! - [`worker`]: the worker runtime (state machine, handler dispatch,
//!   sessions, heartbeat, HTTP surface)
//! - [`scale`] and [`scaler`]: scaling backends and the per-class
//!   policy engine plus autoscaler loop
//! - [`orchestrator`]: operator commands built on the above

pub mod broker;
pub mod cli;
pub mod config;
pub mod context;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod scale;
pub mod scaler;
pub mod store;
pub mod worker;

// Re-export commonly used error types
pub use broker::BrokerError;
pub use orchestrator::OrchestratorError;
pub use scale::ScaleError;
pub use scaler::ScalerError;
pub use store::StoreError;
pub use worker::{HandlerError, WorkerError};
