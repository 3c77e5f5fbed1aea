//! Metrics: queue depth measurement and Prometheus export.
//!
//! - [`queue`] computes the *true depth* demand signal the scaler acts on
//! - [`prometheus`] registers and exports the metric families
//! - [`collectors`] records worker-side metrics under a fixed label set
//!
//! # Example
//!
//! ```ignore
//! use taskplane::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("metrics init");
//! // ... run ...
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod queue;

pub use collectors::{ResourceSampler, ResourceSnapshot, WorkerMetricsRecorder};
pub use prometheus::{export_metrics, init_metrics};
pub use queue::{QueueDepth, QueueHealth, QueueMetrics};
