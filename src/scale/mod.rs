//! Scaling backends: adapters that adjust worker replica counts.
//!
//! One trait ([`ScalingBackend`]), three production implementations
//! (local container daemon, Kubernetes, Fly.io) plus an in-memory
//! recording backend for tests. The scaling service treats them all
//! identically.

pub mod backend;
pub mod docker_api;
pub mod fly;
pub mod kubernetes;
pub mod mock;

pub use backend::{BackendHealth, ScaleError, ScalingBackend, HARD_REPLICA_CAP};
pub use docker_api::{DockerBackend, DockerBackendConfig};
pub use fly::FlyBackend;
pub use kubernetes::KubernetesBackend;
pub use mock::MockBackend;
