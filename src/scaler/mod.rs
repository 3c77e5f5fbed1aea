//! Autoscaling: per-class policy plus the periodic loop driving it.

pub mod autoscaler;
pub mod config;
pub mod service;

pub use autoscaler::Autoscaler;
pub use config::{ScalerConfig, WorkerClassConfig};
pub use service::{
    ScalerError, ScalingDecision, ScalingEvent, ScalingService, SCALING_EVENTS_STREAM,
};
